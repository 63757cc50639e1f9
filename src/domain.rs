use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

/// Identifier fields an archive can be addressed by when building paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierField {
    Domain,
    #[serde(alias = "component_name")]
    Component,
    #[serde(alias = "model_name")]
    Model,
}

impl IdentifierField {
    pub fn value<'a>(&self, archive: &'a ArchiveDescriptor) -> &'a str {
        match self {
            IdentifierField::Domain => &archive.domain,
            IdentifierField::Component => &archive.component,
            IdentifierField::Model => &archive.model,
        }
    }
}

impl fmt::Display for IdentifierField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierField::Domain => write!(f, "domain"),
            IdentifierField::Component => write!(f, "component"),
            IdentifierField::Model => write!(f, "model"),
        }
    }
}

impl FromStr for IdentifierField {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "domain" => Ok(IdentifierField::Domain),
            "component" | "component_name" => Ok(IdentifierField::Component),
            "model" | "model_name" => Ok(IdentifierField::Model),
            other => Err(KiraError::InvalidPathTemplate(format!(
                "unknown field '{other}' (expected domain, component or model)"
            ))),
        }
    }
}

/// Ordered list of identifier fields that composes a destination path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<IdentifierField>", into = "Vec<IdentifierField>")]
pub struct PathTemplate(Vec<IdentifierField>);

impl PathTemplate {
    pub fn new(fields: Vec<IdentifierField>) -> Result<Self, KiraError> {
        if fields.is_empty() {
            return Err(KiraError::InvalidPathTemplate(
                "at least one field is required".to_string(),
            ));
        }
        Ok(Self(fields))
    }

    pub fn fields(&self) -> &[IdentifierField] {
        &self.0
    }

    /// Relative path for `archive`, one segment per field.
    pub fn resolve(&self, archive: &ArchiveDescriptor) -> Utf8PathBuf {
        self.0
            .iter()
            .map(|field| field.value(archive))
            .collect::<Utf8PathBuf>()
    }
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self(vec![
            IdentifierField::Domain,
            IdentifierField::Component,
            IdentifierField::Model,
        ])
    }
}

impl TryFrom<Vec<IdentifierField>> for PathTemplate {
    type Error = KiraError;

    fn try_from(value: Vec<IdentifierField>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PathTemplate> for Vec<IdentifierField> {
    fn from(value: PathTemplate) -> Self {
        value.0
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self
            .0
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        write!(f, "{}", names.join(","))
    }
}

impl FromStr for PathTemplate {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let fields = value
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<IdentifierField>, _>>()?;
        Self::new(fields)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[serde(rename = "md5")]
    Md5,
    #[serde(rename = "sha-1")]
    Sha1,
    #[serde(rename = "sha-224")]
    Sha224,
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "sha-384")]
    Sha384,
    #[serde(rename = "sha-512")]
    Sha512,
}

impl ChecksumAlgorithm {
    fn digest_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Sha1 => 40,
            ChecksumAlgorithm::Sha224 => 56,
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha384 => 96,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Md5 => write!(f, "md5"),
            ChecksumAlgorithm::Sha1 => write!(f, "sha-1"),
            ChecksumAlgorithm::Sha224 => write!(f, "sha-224"),
            ChecksumAlgorithm::Sha256 => write!(f, "sha-256"),
            ChecksumAlgorithm::Sha384 => write!(f, "sha-384"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha-512"),
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha-1" | "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha-224" | "sha224" => Ok(ChecksumAlgorithm::Sha224),
            "sha-256" | "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha-384" | "sha384" => Ok(ChecksumAlgorithm::Sha384),
            "sha-512" | "sha512" => Ok(ChecksumAlgorithm::Sha512),
            other => Err(KiraError::InvalidChecksum(format!(
                "unsupported algorithm '{other}'"
            ))),
        }
    }
}

/// Expected digest of an archive. Renders as `<algorithm>=<hex>`, the form
/// aria2 takes for `--checksum`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl Checksum {
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.algorithm, self.digest)
    }
}

impl FromStr for Checksum {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (algorithm, digest) = match trimmed.split_once('=') {
            Some((algo, digest)) => (algo.parse::<ChecksumAlgorithm>()?, digest),
            None => (ChecksumAlgorithm::Md5, trimmed),
        };
        let digest = digest.trim().to_ascii_lowercase();
        let is_valid = digest.len() == algorithm.digest_len()
            && digest.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(KiraError::InvalidChecksum(value.to_string()));
        }
        Ok(Self { algorithm, digest })
    }
}

impl TryFrom<String> for Checksum {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Checksum> for String {
    fn from(value: Checksum) -> Self {
        value.to_string()
    }
}

/// One downloadable archive as enumerated by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveDescriptor {
    pub domain: String,
    pub component: String,
    pub model: String,
    pub url: String,
    pub file_name: String,
    pub checksum: Option<Checksum>,
    /// Path segments leading to the payload once the archive is unpacked.
    pub internal_layout: Vec<String>,
}

impl ArchiveDescriptor {
    pub fn new(
        domain: &str,
        component: &str,
        model: &str,
        url: &str,
    ) -> Result<Self, KiraError> {
        let file_name = file_name_from_url(url)?;
        Ok(Self {
            domain: validate_identifier(domain)?,
            component: validate_identifier(component)?,
            model: validate_identifier(model)?,
            url: url.trim().to_string(),
            file_name,
            checksum: None,
            internal_layout: vec![model.trim().to_string()],
        })
    }

    pub fn with_checksum(mut self, checksum: Option<Checksum>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn with_file_name(mut self, file_name: &str) -> Result<Self, KiraError> {
        self.file_name = validate_identifier(file_name)?;
        Ok(self)
    }

    /// Resolves the payload location inside the unpacked archive from fields
    /// of this descriptor.
    pub fn with_internal_layout(mut self, fields: &[IdentifierField]) -> Self {
        self.internal_layout = fields
            .iter()
            .map(|field| field.value(&self).to_string())
            .collect();
        self
    }

    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.component, self.domain, self.model)
    }
}

/// Identifier values become path segments, so anything that could escape the
/// destination root is refused.
pub fn validate_identifier(value: &str) -> Result<String, KiraError> {
    let trimmed = value.trim();
    let is_valid = !trimmed.is_empty()
        && trimmed != "."
        && trimmed != ".."
        && !trimmed.contains(['/', '\\', '\0']);
    if !is_valid {
        return Err(KiraError::InvalidIdentifier(value.to_string()));
    }
    Ok(trimmed.to_string())
}

pub fn file_name_from_url(url: &str) -> Result<String, KiraError> {
    let without_query = url
        .trim()
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let name = without_query.rsplit('/').next().unwrap_or_default();
    validate_identifier(name)
        .map_err(|_| KiraError::InvalidCatalog(format!("cannot derive file name from {url}")))
}

/// Either every value or an explicit set of them; the literal `all` selects
/// everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Selection<T: Ord> {
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord> Selection<T> {
    pub fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }
}

impl Selection<String> {
    pub fn from_values<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for value in values {
            for part in value.as_ref().split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                if part == "all" {
                    return Selection::All;
                }
                set.insert(part.to_string());
            }
        }
        if set.is_empty() {
            Selection::All
        } else {
            Selection::Only(set)
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Only(set) => set.contains(value),
        }
    }
}

impl fmt::Display for Selection<String> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::All => write!(f, "all"),
            Selection::Only(set) => {
                write!(f, "{}", set.iter().cloned().collect::<Vec<_>>().join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsetTier {
    Debug,
    Tiny,
    Medium,
    Full,
    Fullplus,
}

impl fmt::Display for SubsetTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubsetTier::Debug => write!(f, "debug"),
            SubsetTier::Tiny => write!(f, "tiny"),
            SubsetTier::Medium => write!(f, "medium"),
            SubsetTier::Full => write!(f, "full"),
            SubsetTier::Fullplus => write!(f, "fullplus"),
        }
    }
}

impl FromStr for SubsetTier {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "debug" => Ok(SubsetTier::Debug),
            "tiny" => Ok(SubsetTier::Tiny),
            "medium" => Ok(SubsetTier::Medium),
            "full" => Ok(SubsetTier::Full),
            "fullplus" => Ok(SubsetTier::Fullplus),
            other => Err(KiraError::InvalidCatalog(format!("unknown subset '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Val => write!(f, "val"),
            Split::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Split {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "train" => Ok(Split::Train),
            "val" => Ok(Split::Val),
            "test" => Ok(Split::Test),
            other => Err(KiraError::InvalidCatalog(format!("unknown split '{other}'"))),
        }
    }
}

/// Parses a single value where `all` means "no restriction".
pub fn parse_scoped<T: FromStr>(value: &str) -> Result<Option<T>, T::Err> {
    if value.trim() == "all" {
        return Ok(None);
    }
    value.parse().map(Some)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn archive() -> ArchiveDescriptor {
        ArchiveDescriptor::new(
            "point_info",
            "taskonomy",
            "yscloskey",
            "https://datasets.example.org/taskonomy/yscloskey-point_info.tar",
        )
        .unwrap()
    }

    #[test]
    fn default_template_nests_domain_component_model() {
        let path = PathTemplate::default().resolve(&archive());
        assert_eq!(path, Utf8PathBuf::from("point_info/taskonomy/yscloskey"));
    }

    #[test]
    fn parse_template_accepts_legacy_names() {
        let template: PathTemplate = "model_name, component_name".parse().unwrap();
        assert_eq!(
            template.fields(),
            &[IdentifierField::Model, IdentifierField::Component]
        );
        assert_eq!(template.to_string(), "model,component");
    }

    #[test]
    fn parse_template_rejects_unknown_and_empty() {
        assert_matches!(
            "domain,url".parse::<PathTemplate>(),
            Err(KiraError::InvalidPathTemplate(_))
        );
        assert_matches!(
            " , ".parse::<PathTemplate>(),
            Err(KiraError::InvalidPathTemplate(_))
        );
    }

    #[test]
    fn parse_checksum_with_and_without_prefix() {
        let prefixed: Checksum = "md5=9F9752D74B07BCC164AF4A6C61B0ECA1".parse().unwrap();
        assert_eq!(prefixed.algorithm(), ChecksumAlgorithm::Md5);
        assert_eq!(prefixed.to_string(), "md5=9f9752d74b07bcc164af4a6c61b0eca1");

        let bare: Checksum = "9f9752d74b07bcc164af4a6c61b0eca1".parse().unwrap();
        assert_eq!(bare, prefixed);

        let sha: Checksum = format!("sha256={}", "a".repeat(64)).parse().unwrap();
        assert_eq!(sha.to_string(), format!("sha-256={}", "a".repeat(64)));
    }

    #[test]
    fn parse_checksum_invalid() {
        assert_matches!("md5=xyz".parse::<Checksum>(), Err(KiraError::InvalidChecksum(_)));
        assert_matches!(
            format!("crc32={}", "a".repeat(8)).parse::<Checksum>(),
            Err(KiraError::InvalidChecksum(_))
        );
    }

    #[test]
    fn descriptor_derives_file_name_and_layout() {
        let archive = archive().with_internal_layout(&[IdentifierField::Domain]);
        assert_eq!(archive.file_name, "yscloskey-point_info.tar");
        assert_eq!(archive.internal_layout, vec!["point_info".to_string()]);
    }

    #[test]
    fn identifiers_cannot_escape_root() {
        assert_matches!(
            ArchiveDescriptor::new("..", "taskonomy", "m", "https://h/a.tar"),
            Err(KiraError::InvalidIdentifier(_))
        );
        assert_matches!(
            ArchiveDescriptor::new("rgb", "a/b", "m", "https://h/a.tar"),
            Err(KiraError::InvalidIdentifier(_))
        );
        assert_matches!(
            ArchiveDescriptor::new("rgb", "c", "m", "https://h/"),
            Err(KiraError::InvalidCatalog(_))
        );
    }

    #[test]
    fn selection_from_values() {
        assert!(Selection::from_values(["rgb", "all"]).is_all());
        let only = Selection::from_values(["rgb,normal", "depth_zbuffer"]);
        assert!(only.contains("normal"));
        assert!(!only.contains("mask_valid"));
        assert_eq!(only.to_string(), "depth_zbuffer,normal,rgb");
    }

    #[test]
    fn scoped_values() {
        assert_eq!(parse_scoped::<Split>("all").unwrap(), None);
        assert_eq!(parse_scoped::<Split>("val").unwrap(), Some(Split::Val));
        assert_eq!(
            parse_scoped::<SubsetTier>("fullplus").unwrap(),
            Some(SubsetTier::Fullplus)
        );
        assert!(parse_scoped::<SubsetTier>("huge").is_err());
    }
}
