use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::policy::ExecutionPolicy;

/// `image_reference` value meaning "reuse the host's system directories,
/// read-only" instead of a prebuilt root filesystem.
pub const HOST_IMAGE: &str = "host";

const PLACEHOLDERS: [&str; 3] = ["source", "workdir", "stdin"];

/// Values substituted into a [`CommandTemplate`].
///
/// All paths are as seen by the sandboxed program.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    pub source: String,
    pub workdir: String,
    pub stdin: String,
}

/// A whitespace-separated argv template such as `g++ -O2 -o {workdir}/main {source}`.
///
/// Placeholders are validated when the template is parsed, so rendering
/// cannot fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandTemplate {
    raw: String,
    args: Vec<String>,
}

/// What the first argument of a template refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramRef<'a> {
    /// A bare program name resolved through the policy allow-list.
    Binary(&'a str),
    /// A file the run itself produced inside the workspace, e.g. a compiled binary.
    Workspace,
    /// Anything else (absolute host paths, other placeholders).
    Other(&'a str),
}

impl CommandTemplate {
    pub fn parse(raw: &str) -> Result<Self> {
        let args: Vec<String> = raw.split_whitespace().map(String::from).collect();
        if args.is_empty() {
            return Err(SandboxError::Config("empty command template".into()));
        }
        for arg in &args {
            check_placeholders(arg)?;
        }
        Ok(Self {
            raw: raw.trim().to_string(),
            args,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn program(&self) -> ProgramRef<'_> {
        let first = self.args.first().map(String::as_str).unwrap_or_default();
        if first.starts_with("{workdir}/") {
            ProgramRef::Workspace
        } else if first.contains('/') || first.contains('{') {
            ProgramRef::Other(first)
        } else {
            ProgramRef::Binary(first)
        }
    }

    pub fn render(&self, vars: &TemplateVars) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &vars.source)
                    .replace("{workdir}", &vars.workdir)
                    .replace("{stdin}", &vars.stdin)
            })
            .collect()
    }
}

fn check_placeholders(arg: &str) -> Result<()> {
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        let after = rest.get(open + 1..).unwrap_or_default();
        let Some(close) = after.find('}') else {
            return Err(SandboxError::Config(format!(
                "unterminated placeholder in {arg:?}"
            )));
        };
        let name = after.get(..close).unwrap_or_default();
        if !PLACEHOLDERS.contains(&name) {
            return Err(SandboxError::Config(format!(
                "unknown placeholder {{{name}}} in {arg:?}"
            )));
        }
        rest = after.get(close + 1..).unwrap_or_default();
    }
    Ok(())
}

impl TryFrom<String> for CommandTemplate {
    type Error = SandboxError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<CommandTemplate> for String {
    fn from(template: CommandTemplate) -> Self {
        template.raw
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A prebuilt hardened environment for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxImage {
    pub language_id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_image_reference")]
    pub image_reference: String,
    /// File name the submitted source is written to inside the workspace.
    pub source_file: String,
    #[serde(default)]
    pub compile_template: Option<CommandTemplate>,
    pub entrypoint_template: CommandTemplate,
}

fn default_image_reference() -> String {
    HOST_IMAGE.to_string()
}

impl SandboxImage {
    pub fn uses_host_root(&self) -> bool {
        self.image_reference == HOST_IMAGE
    }

    fn validate(&self) -> Result<()> {
        if self.language_id.trim().is_empty() {
            return Err(SandboxError::Config("language_id is empty".into()));
        }
        let name = &self.source_file;
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(SandboxError::Config(format!(
                "{}: source_file must be a plain file name, got {name:?}",
                self.language_id
            )));
        }
        if self.image_reference.is_empty() {
            return Err(SandboxError::Config(format!(
                "{}: image_reference is empty",
                self.language_id
            )));
        }
        Ok(())
    }

    /// Verify every program this image launches is reachable under `policy`.
    pub fn check_policy(&self, policy: &ExecutionPolicy) -> Result<()> {
        let templates = self
            .compile_template
            .iter()
            .chain(std::iter::once(&self.entrypoint_template));
        for template in templates {
            match template.program() {
                ProgramRef::Workspace => {}
                ProgramRef::Binary(name) if policy.allows_binary(name) => {}
                ProgramRef::Binary(name) => {
                    return Err(SandboxError::Config(format!(
                        "{}: {name} is not in allowed_binaries",
                        self.language_id
                    )));
                }
                ProgramRef::Other(program) => {
                    return Err(SandboxError::Config(format!(
                        "{}: program must be an allowed binary name or a {{workdir}} path, got {program:?}",
                        self.language_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Collects images during startup. Consumed by [`RegistryBuilder::freeze`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    images: Vec<SandboxImage>,
    index: HashMap<String, usize>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, image: SandboxImage) -> Result<()> {
        image.validate()?;
        let slot = self.images.len();
        let keys: Vec<String> = std::iter::once(&image.language_id)
            .chain(&image.aliases)
            .map(|k| normalize(k.as_str()))
            .collect();
        for key in &keys {
            if self.index.contains_key(key) {
                return Err(SandboxError::Config(format!(
                    "language {key:?} registered twice"
                )));
            }
        }
        for key in keys {
            self.index.insert(key, slot);
        }
        self.images.push(image);
        Ok(())
    }

    pub fn freeze(self) -> ImageRegistry {
        ImageRegistry {
            images: self.images,
            index: self.index,
        }
    }
}

/// Read-only `language_id → SandboxImage` mapping.
///
/// Has no mutating methods; share it behind an `Arc` for lock-free reads.
#[derive(Debug)]
pub struct ImageRegistry {
    images: Vec<SandboxImage>,
    index: HashMap<String, usize>,
}

impl ImageRegistry {
    pub fn resolve(&self, language_id: &str) -> Result<&SandboxImage> {
        self.index
            .get(&normalize(language_id))
            .and_then(|slot| self.images.get(*slot))
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language_id.to_string()))
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.images.iter().map(|i| i.language_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn check_policy(&self, policy: &ExecutionPolicy) -> Result<()> {
        self.images.iter().try_for_each(|i| i.check_policy(policy))
    }
}

fn normalize(language_id: &str) -> String {
    language_id.trim().to_ascii_lowercase()
}
