use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    ArchiveDescriptor, Checksum, IdentifierField, Split, SubsetTier, validate_identifier,
};
use crate::error::KiraError;

#[derive(Debug, Deserialize, Serialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub splits: BTreeMap<String, Option<BTreeMap<String, Vec<String>>>>,
    #[serde(default)]
    pub subsets: BTreeMap<String, Option<BTreeMap<String, Vec<String>>>>,
}

/// One remote server and the archive links it publishes.
#[derive(Debug, Deserialize, Serialize)]
pub struct ServerEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub component: String,
    /// Plain-text list of links, one per line, used when `links` is empty.
    #[serde(default)]
    pub link_file: Option<String>,
    #[serde(default = "default_file_name_fields")]
    pub file_name_fields: Vec<IdentifierField>,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default = "default_internal_layout")]
    pub internal_layout: Vec<IdentifierField>,
    #[serde(default)]
    pub links: Vec<LinkEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LinkEntry {
    Shorthand(String),
    Detailed(LinkEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LinkEntryObject {
    pub url: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub component: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
}

fn default_file_name_fields() -> Vec<IdentifierField> {
    vec![IdentifierField::Model, IdentifierField::Domain]
}

fn default_separator() -> String {
    "-".to_string()
}

fn default_internal_layout() -> Vec<IdentifierField> {
    vec![IdentifierField::Model]
}

/// Membership lists per component; `None` means the component is not
/// partitioned along that axis.
pub type Partitions<K> = BTreeMap<String, Option<BTreeMap<K, BTreeSet<String>>>>;

#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub name: String,
    pub source: Option<String>,
    pub archives: usize,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    servers: Vec<ServerSummary>,
    archives: Vec<ArchiveDescriptor>,
    splits: Partitions<Split>,
    subsets: Partitions<SubsetTier>,
}

impl Catalog {
    pub fn new(
        archives: Vec<ArchiveDescriptor>,
        splits: Partitions<Split>,
        subsets: Partitions<SubsetTier>,
    ) -> Self {
        Self {
            servers: Vec::new(),
            archives,
            splits,
            subsets,
        }
    }

    /// Loads a catalog from a local path or an http(s) URL.
    pub fn load(location: &str) -> Result<Self, KiraError> {
        let reader = SourceReader::new()?;
        let content = reader.read(location)?;
        let file: CatalogFile = serde_json::from_str(&content)
            .map_err(|err| KiraError::InvalidCatalog(err.to_string()))?;
        Self::resolve(file, &reader)
    }

    pub fn from_json(content: &str) -> Result<Self, KiraError> {
        let file: CatalogFile = serde_json::from_str(content)
            .map_err(|err| KiraError::InvalidCatalog(err.to_string()))?;
        Self::resolve(file, &SourceReader::offline())
    }

    fn resolve(file: CatalogFile, reader: &SourceReader) -> Result<Self, KiraError> {
        let mut archives = Vec::new();
        let mut servers = Vec::new();

        for server in file.servers {
            let component = validate_identifier(&server.component)?;
            let defaults = ServerDefaults {
                file_name_fields: &server.file_name_fields,
                separator: &server.separator,
                internal_layout: &server.internal_layout,
                component: &component,
            };
            let links = if server.links.is_empty() {
                match &server.link_file {
                    Some(location) => read_link_file(&reader.read(location)?),
                    None => Vec::new(),
                }
            } else {
                server.links
            };

            let before = archives.len();
            for link in links {
                archives.push(parse_link(&defaults, link)?);
            }
            debug!(
                component = %component,
                archives = archives.len() - before,
                "catalog server parsed"
            );
            servers.push(ServerSummary {
                name: server.name.unwrap_or_else(|| component.clone()),
                source: server.link_file,
                archives: archives.len() - before,
            });
        }

        Ok(Self {
            servers,
            archives,
            splits: resolve_partitions(file.splits)?,
            subsets: resolve_partitions(file.subsets)?,
        })
    }

    pub fn archives(&self) -> &[ArchiveDescriptor] {
        &self.archives
    }

    pub fn servers(&self) -> &[ServerSummary] {
        &self.servers
    }

    pub fn splits(&self) -> &Partitions<Split> {
        &self.splits
    }

    pub fn subsets(&self) -> &Partitions<SubsetTier> {
        &self.subsets
    }
}

struct ServerDefaults<'a> {
    file_name_fields: &'a [IdentifierField],
    separator: &'a str,
    internal_layout: &'a [IdentifierField],
    component: &'a str,
}

fn read_link_file(content: &str) -> Vec<LinkEntry> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| LinkEntry::Shorthand(line.to_string()))
        .collect()
}

fn parse_link(
    defaults: &ServerDefaults<'_>,
    link: LinkEntry,
) -> Result<ArchiveDescriptor, KiraError> {
    let object = match link {
        LinkEntry::Detailed(object) => object,
        LinkEntry::Shorthand(value) => {
            let mut parts = value.split_whitespace();
            let url = parts
                .next()
                .ok_or_else(|| KiraError::InvalidCatalog("empty link".to_string()))?;
            LinkEntryObject {
                url: url.to_string(),
                domain: None,
                component: None,
                model: None,
                file_name: None,
                checksum: parts.next().map(str::to_string),
            }
        }
    };

    let file_name = match &object.file_name {
        Some(name) => validate_identifier(name)?,
        None => crate::domain::file_name_from_url(&object.url)?,
    };
    let from_name = split_file_name(&file_name, defaults.file_name_fields, defaults.separator);
    let field = |explicit: &Option<String>, which: IdentifierField| -> Option<String> {
        explicit.clone().or_else(|| from_name.get(&which).cloned())
    };

    let domain = field(&object.domain, IdentifierField::Domain).ok_or_else(|| {
        KiraError::InvalidCatalog(format!("no domain for link {}", object.url))
    })?;
    let model = field(&object.model, IdentifierField::Model).ok_or_else(|| {
        KiraError::InvalidCatalog(format!("no model name for link {}", object.url))
    })?;
    let component = field(&object.component, IdentifierField::Component)
        .unwrap_or_else(|| defaults.component.to_string());
    let checksum = object
        .checksum
        .as_deref()
        .map(str::parse::<Checksum>)
        .transpose()?;

    Ok(ArchiveDescriptor::new(&domain, &component, &model, &object.url)?
        .with_file_name(&file_name)?
        .with_checksum(checksum)
        .with_internal_layout(defaults.internal_layout))
}

/// Splits the archive stem into identifier fields; the last field keeps any
/// remaining separators.
fn split_file_name(
    file_name: &str,
    fields: &[IdentifierField],
    separator: &str,
) -> BTreeMap<IdentifierField, String> {
    let stem = strip_archive_extension(file_name);
    if fields.is_empty() || separator.is_empty() {
        return BTreeMap::new();
    }
    let parts = stem.splitn(fields.len(), separator).collect::<Vec<_>>();
    if parts.len() != fields.len() {
        return BTreeMap::new();
    }
    fields
        .iter()
        .copied()
        .zip(parts.into_iter().map(str::to_string))
        .collect()
}

pub fn strip_archive_extension(file_name: &str) -> &str {
    const EXTENSIONS: [&str; 5] = [".tar.gz", ".tgz", ".tar", ".zip", ".gz"];
    EXTENSIONS
        .iter()
        .find_map(|ext| file_name.strip_suffix(ext))
        .unwrap_or(file_name)
}

fn resolve_partitions<K: std::str::FromStr<Err = KiraError> + Ord>(
    raw: BTreeMap<String, Option<BTreeMap<String, Vec<String>>>>,
) -> Result<Partitions<K>, KiraError> {
    raw.into_iter()
        .map(|(component, groups)| {
            let groups = groups
                .map(|groups| {
                    groups
                        .into_iter()
                        .map(|(key, members)| {
                            Ok((key.parse::<K>()?, members.into_iter().collect()))
                        })
                        .collect::<Result<BTreeMap<_, _>, KiraError>>()
                })
                .transpose()?;
            Ok((component, groups))
        })
        .collect()
}

/// Reads catalog documents from disk or over HTTP.
struct SourceReader {
    client: Option<Client>,
}

impl SourceReader {
    fn new() -> Result<Self, KiraError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-dd/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| KiraError::InvalidCatalog(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| KiraError::InvalidCatalog(err.to_string()))?;
        Ok(Self {
            client: Some(client),
        })
    }

    fn offline() -> Self {
        Self { client: None }
    }

    fn read(&self, location: &str) -> Result<String, KiraError> {
        let is_remote = location.starts_with("http://") || location.starts_with("https://");
        if !is_remote {
            return fs::read_to_string(location)
                .map_err(|_| KiraError::CatalogRead(PathBuf::from(location)));
        }
        let client = self.client.as_ref().ok_or_else(|| {
            KiraError::InvalidCatalog(format!("remote source not allowed here: {location}"))
        })?;
        debug!(location, "fetching catalog source");
        let response = client
            .get(location)
            .send()
            .map_err(|err| KiraError::InvalidCatalog(format!("{location}: {err}")))?;
        if !response.status().is_success() {
            return Err(KiraError::InvalidCatalog(format!(
                "{location} returned status {}",
                response.status().as_u16()
            )));
        }
        response
            .text()
            .map_err(|err| KiraError::InvalidCatalog(format!("{location}: {err}")))
    }
}
