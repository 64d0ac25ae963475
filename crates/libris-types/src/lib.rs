//! Value types shared by every Libris crate.
//!
//! - [`StoredName`] is the only way a file name reaches the storage directory. Construction
//!   rejects anything that could resolve outside that directory.
//! - [`Category`] is the coarse content family derived from a file's extension.
//! - [`size_in_mb`] / [`size_in_gb`] produce the derived size views reported to clients.

use std::path::Path;

/// Maximum length, in bytes, of a stored file name.
///
/// Matches the common `NAME_MAX` of Linux and macOS filesystems.
pub const MAX_NAME_LEN: usize = 255;

/// Errors that can occur when validating a file name.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NameError {
    /// The input was empty or contained only whitespace
    #[error("file name cannot be empty")]
    Empty,

    /// The input contained a path separator or a parent-directory token
    #[error("file name must not contain path separators or '..': {0}")]
    Traversal(String),

    /// The input started with a dot (hidden and staging files are off limits)
    #[error("file name must not start with '.': {0}")]
    Hidden(String),

    /// The input contained control characters
    #[error("file name contains control characters")]
    ControlCharacters,

    /// The input exceeded [`MAX_NAME_LEN`]
    #[error("file name exceeds {MAX_NAME_LEN} bytes")]
    TooLong,
}

/// A file name that is safe to join onto the storage directory.
///
/// A `StoredName` is a single path component: it never contains `/`, `\` or `..`, never
/// starts with `.`, and contains no control characters. Surrounding whitespace is trimmed
/// during construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoredName(String);

impl StoredName {
    /// Validates `input` as a stored file name.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] describing the first rule the input breaks.
    pub fn parse(input: impl AsRef<str>) -> Result<Self, NameError> {
        let trimmed = input.as_ref().trim();
        if trimmed.is_empty() {
            return Err(NameError::Empty);
        }
        if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains("..") {
            return Err(NameError::Traversal(trimmed.to_owned()));
        }
        if trimmed.starts_with('.') {
            return Err(NameError::Hidden(trimmed.to_owned()));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(NameError::ControlCharacters);
        }
        if trimmed.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong);
        }
        Ok(Self(trimmed.to_owned()))
    }

    /// Validates a filename as sent by an upload client.
    ///
    /// Browsers and some HTTP tools send a full client-side path (`C:\fakepath\report.pdf`).
    /// Only the final component is kept before the usual [`StoredName::parse`] rules apply.
    ///
    /// # Errors
    ///
    /// Returns a [`NameError`] if the final component is not a valid stored name.
    pub fn from_upload(raw: &str) -> Result<Self, NameError> {
        let last = raw.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(raw);
        Self::parse(last)
    }

    /// Returns the inner string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the extension exactly as written, without the leading dot.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.0).extension().and_then(|e| e.to_str())
    }

    /// Returns the lower-cased extension with its leading dot (`".pdf"`), if any.
    pub fn normalized_extension(&self) -> Option<String> {
        self.extension().map(|e| format!(".{}", e.to_ascii_lowercase()))
    }

    /// Returns the name without its final extension.
    pub fn stem(&self) -> &str {
        Path::new(&self.0)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.0)
    }

    /// Builds the `n`th deduplicated variant of this name: `base_n.ext`.
    ///
    /// # Errors
    ///
    /// Returns [`NameError::TooLong`] if the suffixed name no longer fits.
    pub fn with_suffix(&self, n: u32) -> Result<Self, NameError> {
        let candidate = match self.extension() {
            Some(ext) => format!("{}_{}.{}", self.stem(), n, ext),
            None => format!("{}_{}", self.stem(), n),
        };
        Self::parse(candidate)
    }
}

impl std::fmt::Display for StoredName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for StoredName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for StoredName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StoredName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        StoredName::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Content family of a cataloged file.
///
/// Derived purely from the extension; see the policy table in `libris-core`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Category {
    #[default]
    Document,
    Spreadsheet,
    Presentation,
    Image,
    Archive,
    DiskImage,
    VirtualMachine,
    VirtualDisk,
}

impl Category {
    /// Every category, in display order.
    pub const ALL: [Category; 8] = [
        Category::Document,
        Category::Spreadsheet,
        Category::Presentation,
        Category::Image,
        Category::Archive,
        Category::DiskImage,
        Category::VirtualMachine,
        Category::VirtualDisk,
    ];

    /// Returns the wire tag used in the catalog and API responses.
    pub fn tag(&self) -> &'static str {
        match self {
            Category::Document => "document",
            Category::Spreadsheet => "spreadsheet",
            Category::Presentation => "presentation",
            Category::Image => "image",
            Category::Archive => "archive",
            Category::DiskImage => "disk_image",
            Category::VirtualMachine => "virtual_machine",
            Category::VirtualDisk => "virtual_disk",
        }
    }

    /// Resolves a wire tag, including the tags written by the legacy catalog.
    ///
    /// Returns `None` for anything unrecognised.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let category = match tag.trim().to_ascii_lowercase().as_str() {
            "document" | "documento" => Category::Document,
            "spreadsheet" | "hoja_calculo" => Category::Spreadsheet,
            "presentation" | "presentacion" => Category::Presentation,
            "image" | "imagen" => Category::Image,
            "archive" | "comprimido" => Category::Archive,
            "disk_image" => Category::DiskImage,
            "virtual_machine" => Category::VirtualMachine,
            "virtual_disk" => Category::VirtualDisk,
            _ => return None,
        };
        Some(category)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl serde::Serialize for Category {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> serde::Deserialize<'de> for Category {
    /// Unknown tags read as [`Category::Document`] so old or hand-edited catalogs still load.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Category::from_tag(&s).unwrap_or_default())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Size in mebibytes, rounded to two decimals.
pub fn size_in_mb(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0))
}

/// Size in gibibytes, rounded to two decimals.
pub fn size_in_gb(bytes: u64) -> f64 {
    round2(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}
