use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationName {
    Resize,
    GenerativeFill,
    RemoveBackground,
    Cleanup,
    Upscale,
    ExtractText,
}

impl OperationName {
    pub const ALL: [Self; 6] = [
        Self::Resize,
        Self::GenerativeFill,
        Self::RemoveBackground,
        Self::Cleanup,
        Self::Upscale,
        Self::ExtractText,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resize => "resize",
            Self::GenerativeFill => "generative_fill",
            Self::RemoveBackground => "remove_background",
            Self::Cleanup => "cleanup",
            Self::Upscale => "upscale",
            Self::ExtractText => "extract_text",
        }
    }
}

/// Primary or secondary image handed to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRef {
    Path(PathBuf),
    Bytes {
        data: Vec<u8>,
        file_name: Option<String>,
    },
}

impl InputRef {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(data: Vec<u8>, file_name: Option<String>) -> Self {
        Self::Bytes { data, file_name }
    }

    pub fn file_name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .and_then(|v| v.to_str())
                .unwrap_or("image.png")
                .to_string(),
            Self::Bytes { file_name, .. } => file_name
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .unwrap_or("image.png")
                .to_string(),
        }
    }

    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        match self {
            Self::Path(path) => fs::read(path),
            Self::Bytes { data, .. } => Ok(data.clone()),
        }
    }

    /// Resolves the input to a file the local program can open. Byte buffers
    /// are written to a temp file that lives as long as the returned value.
    pub fn materialize(&self) -> std::io::Result<MaterializedInput> {
        match self {
            Self::Path(path) => Ok(MaterializedInput {
                path: path.clone(),
                owned: false,
            }),
            Self::Bytes { data, .. } => {
                let extension = Path::new(self.file_name().as_str())
                    .extension()
                    .and_then(|v| v.to_str())
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_else(|| String::from("png"));
                let path = std::env::temp_dir()
                    .join(format!("imgpop_input_{}.{extension}", Uuid::new_v4()));
                fs::write(path.as_path(), data)?;
                Ok(MaterializedInput { path, owned: true })
            }
        }
    }
}

#[derive(Debug)]
pub struct MaterializedInput {
    path: PathBuf,
    owned: bool,
}

impl MaterializedInput {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for MaterializedInput {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        if let Err(error) = fs::remove_file(self.path.as_path()) {
            warn!(path = %self.path.display(), error = %error, "failed to remove temp input");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl ParamValue {
    pub fn to_arg(&self) -> String {
        match self {
            Self::Text(value) => value.clone(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Bool(value) => value.to_string(),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation: OperationName,
    pub input: InputRef,
    pub params: BTreeMap<String, ParamValue>,
    pub secondary_input: Option<InputRef>,
}

impl OperationRequest {
    pub fn new(operation: OperationName, input: InputRef) -> Self {
        Self {
            operation,
            input,
            params: BTreeMap::new(),
            secondary_input: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_secondary_input(mut self, input: InputRef) -> Self {
        self.secondary_input = Some(input);
        self
    }

    /// Positional form of a named parameter; absent parameters render as "".
    pub fn param_arg(&self, key: &str) -> String {
        self.params
            .get(key)
            .map(ParamValue::to_arg)
            .unwrap_or_default()
    }
}
