//! Built-in language images used when the config declares none.

use sandbox::{CommandTemplate, HOST_IMAGE, SandboxError, SandboxImage};

/// Allow-list used when the config's policy leaves `allowed_binaries` empty.
/// Covers the preset toolchains, including the assembler and linker g++ and
/// gcc invoke through `PATH`.
pub const DEFAULT_ALLOWED_BINARIES: &[&str] = &[
    "g++", "gcc", "cc", "as", "ld", "python3", "javac", "java", "node",
];

struct Preset {
    language_id: &'static str,
    aliases: &'static [&'static str],
    source_file: &'static str,
    compile: Option<&'static str>,
    entrypoint: &'static str,
}

const PRESETS: &[Preset] = &[
    Preset {
        language_id: "cpp",
        aliases: &["c++", "cxx"],
        source_file: "main.cpp",
        compile: Some("g++ -std=c++17 -O2 -pipe -o {workdir}/main {source}"),
        entrypoint: "{workdir}/main",
    },
    Preset {
        language_id: "c",
        aliases: &[],
        source_file: "main.c",
        compile: Some("gcc -std=c11 -O2 -pipe -o {workdir}/main {source} -lm"),
        entrypoint: "{workdir}/main",
    },
    Preset {
        language_id: "python",
        aliases: &["py", "python3"],
        source_file: "main.py",
        compile: None,
        entrypoint: "python3 -I -B {source}",
    },
    Preset {
        language_id: "java",
        aliases: &[],
        source_file: "Main.java",
        compile: Some("javac -J-Xmx256m -d {workdir} {source}"),
        entrypoint: "java -Xmx256m -XX:ReservedCodeCacheSize=64m -XX:CompressedClassSpaceSize=64m -XX:+UseSerialGC -Xshare:off -cp {workdir} Main",
    },
    Preset {
        language_id: "node",
        aliases: &["js", "javascript", "nodejs"],
        source_file: "main.js",
        compile: None,
        entrypoint: "node --max-old-space-size=256 {source}",
    },
];

/// Preset images, all reusing the host's system directories.
pub fn images() -> Result<Vec<SandboxImage>, SandboxError> {
    PRESETS
        .iter()
        .map(|p| {
            Ok(SandboxImage {
                language_id: p.language_id.to_string(),
                aliases: p.aliases.iter().map(|a| a.to_string()).collect(),
                image_reference: HOST_IMAGE.to_string(),
                source_file: p.source_file.to_string(),
                compile_template: p.compile.map(CommandTemplate::parse).transpose()?,
                entrypoint_template: CommandTemplate::parse(p.entrypoint)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use sandbox::{PolicyConfig, RegistryBuilder, load_policy};

    use super::*;

    #[test]
    fn presets_register_under_default_policy() {
        let policy = load_policy(&PolicyConfig {
            allowed_binaries: DEFAULT_ALLOWED_BINARIES
                .iter()
                .map(|b| b.to_string())
                .collect(),
            ..PolicyConfig::default()
        })
        .unwrap();

        let mut builder = RegistryBuilder::new();
        for image in images().unwrap() {
            builder.register(image).unwrap();
        }
        let registry = builder.freeze();
        registry.check_policy(&policy).unwrap();

        assert_eq!(registry.len(), 5);
        assert_eq!(registry.resolve("c++").unwrap().language_id, "cpp");
        assert_eq!(registry.resolve("py").unwrap().language_id, "python");
        assert_eq!(registry.resolve("js").unwrap().language_id, "node");
    }
}
