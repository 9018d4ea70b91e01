//! Parses the Overmind's INI settings file and the hatchling-config CSV
//! it references.

use std::collections::HashMap;
use std::path::Path;

use ini::Ini;

use crate::error::{SwarmError, SwarmResult};

pub const DEFAULT_MIN_HATCHLINGS_PER_COLONY: usize = 100;
pub const DEFAULT_MAX_HATCHLINGS_PER_COLONY: usize = 200;

#[derive(Debug, Clone)]
pub struct OvermindSettings {
    pub hatchling_config_file: String,
    pub hatchling_offset: usize,
    pub hatchling_count: usize,
    pub min_hatchlings_per_colony: usize,
    pub max_hatchlings_per_colony: usize,
    /// `[HATCHLING]` key/value pairs merged onto every config row.
    pub hatchling_overrides: HashMap<String, String>,
}

pub fn load_settings(path: impl AsRef<Path>) -> SwarmResult<OvermindSettings> {
    let path_ref = path.as_ref();
    let ini = Ini::load_from_file(path_ref).map_err(|source| SwarmError::SettingsParse {
        path: path_ref.display().to_string(),
        source: anyhow::Error::new(source),
    })?;

    let overmind = ini.section(Some("OVERMIND")).ok_or(SwarmError::MissingOvermindSection)?;

    let hatchling_config_file = overmind
        .get("hatchling_config_file")
        .ok_or(SwarmError::MissingOvermindSection)?
        .to_string();
    let hatchling_offset = overmind
        .get("hatchling_offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let hatchling_count = overmind
        .get("hatchling_count")
        .and_then(|v| v.parse().ok())
        .ok_or(SwarmError::MissingOvermindSection)?;
    let min_hatchlings_per_colony = overmind
        .get("min_hatchlings_per_colony")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MIN_HATCHLINGS_PER_COLONY);
    let max_hatchlings_per_colony = overmind
        .get("max_hatchlings_per_colony")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_HATCHLINGS_PER_COLONY);

    let hatchling_overrides = ini
        .section(Some("HATCHLING"))
        .map(|props| props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        .unwrap_or_default();

    Ok(OvermindSettings {
        hatchling_config_file,
        hatchling_offset,
        hatchling_count,
        min_hatchlings_per_colony,
        max_hatchlings_per_colony,
        hatchling_overrides,
    })
}

/// Reads rows `[offset, offset+count)` of the CSV at `path` as dict rows,
/// one-shot — the Overmind calls this once at startup and hands the
/// resulting list to the pending-configs store.
pub fn load_hatchling_configs(
    path: impl AsRef<Path>,
    offset: usize,
    count: usize,
    overrides: &HashMap<String, String>,
) -> SwarmResult<Vec<HashMap<String, String>>> {
    let path_ref = path.as_ref();
    let mut reader = csv::Reader::from_path(path_ref).map_err(|source| SwarmError::HatchlingConfigFile {
        path: path_ref.display().to_string(),
        source: anyhow::Error::new(source),
    })?;

    let headers = reader
        .headers()
        .map_err(|source| SwarmError::HatchlingConfigFile {
            path: path_ref.display().to_string(),
            source: anyhow::Error::new(source),
        })?
        .clone();

    let mut configs = Vec::new();
    for (index, record) in reader.records().enumerate() {
        if index < offset {
            continue;
        }
        if index >= offset + count {
            break;
        }
        let record = record.map_err(|source| SwarmError::HatchlingConfigFile {
            path: path_ref.display().to_string(),
            source: anyhow::Error::new(source),
        })?;

        let mut row: HashMap<String, String> =
            headers.iter().zip(record.iter()).map(|(k, v)| (k.to_string(), v.to_string())).collect();
        for (k, v) in overrides {
            row.insert(k.clone(), v.clone());
        }
        configs.push(row);
    }

    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_overmind_section_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[OVERMIND]\nhatchling_config_file = users.csv\nhatchling_count = 250\n"
        )
        .unwrap();

        let settings = load_settings(file.path()).unwrap();
        assert_eq!(settings.hatchling_config_file, "users.csv");
        assert_eq!(settings.hatchling_count, 250);
        assert_eq!(settings.hatchling_offset, 0);
        assert_eq!(settings.min_hatchlings_per_colony, DEFAULT_MIN_HATCHLINGS_PER_COLONY);
        assert_eq!(settings.max_hatchlings_per_colony, DEFAULT_MAX_HATCHLINGS_PER_COLONY);
    }

    #[test]
    fn missing_overmind_section_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[HATCHLING]\nfoo = bar\n").unwrap();
        let result = load_settings(file.path());
        assert!(matches!(result, Err(SwarmError::MissingOvermindSection)));
    }

    #[test]
    fn hatchling_overrides_merge_onto_every_row() {
        let mut csv_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(csv_file, "username,password\nalice,pw1\nbob,pw2\ncarol,pw3\n").unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("target".to_string(), "https://example.test".to_string());

        let configs = load_hatchling_configs(csv_file.path(), 1, 2, &overrides).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0]["username"], "bob");
        assert_eq!(configs[1]["username"], "carol");
        assert_eq!(configs[0]["target"], "https://example.test");
    }
}
