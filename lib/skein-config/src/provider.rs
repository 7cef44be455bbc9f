use std::path::Path;

use figment::{
    providers::{Data, Json, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// Supported configuration file formats.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileFormat {
    Yaml,
    Json,
}

impl FileFormat {
    /// Picks the format from the file extension, falling back to YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::Json,
            _ => FileFormat::Yaml,
        }
    }
}

/// The parsed contents of a configuration file.
///
/// Unlike figment's own file providers, a missing file is an error here instead of an empty layer.
pub struct FileSnapshot {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl FileSnapshot {
    pub fn read(path: &Path, format: FileFormat) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::from(e.to_string()))?;
        let (data, name) = match format {
            FileFormat::Yaml => (Data::<Yaml>::string(&contents).data()?, "YAML file"),
            FileFormat::Json => (Data::<Json>::string(&contents).data()?, "JSON file"),
        };

        Ok(Self {
            data,
            metadata: Metadata::from(name, path),
        })
    }
}

impl Provider for FileSnapshot {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}
