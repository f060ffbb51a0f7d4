use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tmart_core::{canonical_name, split_repository, ConfigError, SourceTag, Technology};
use tracing::{info, warn};

/// Canonical names at least this similar are reported as likely typos.
pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    sources: SourcesSection,
    #[serde(default, alias = "libraries")]
    technologies: Vec<TechnologyEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SourcesSection {
    github: Option<SourceSection>,
    pypi: Option<SourceSection>,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceSection {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
    #[serde(default)]
    metrics: Option<Vec<String>>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct TechnologyEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    github: Option<String>,
    #[serde(default)]
    github_owner: Option<String>,
    #[serde(default)]
    github_repo: Option<String>,
    #[serde(default, alias = "pypi_package")]
    pypi: Option<String>,
}

/// Per-source settings after validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSettings {
    pub enabled: bool,
    /// The metrics kept from this source; the full catalog unless projected.
    pub metrics: Vec<String>,
}

/// The validated set of tracked technologies. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registry {
    path: PathBuf,
    technologies: Vec<Technology>,
    sources: BTreeMap<SourceTag, SourceSettings>,
}

impl Registry {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let registry = Self::from_yaml_str(&text, path)?;
        info!(
            path = %path.display(),
            technologies = registry.technologies.len(),
            "loaded technology registry"
        );
        Ok(registry)
    }

    pub fn from_yaml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: RegistryFile = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let sources = validate_sources(&file.sources)?;
        let technologies = validate_technologies(file.technologies)?;
        for (a, b, score) in near_duplicates(&technologies) {
            warn!(first = %a, second = %b, score, "technology names are suspiciously similar");
        }

        Ok(Self {
            path: path.to_path_buf(),
            technologies,
            sources,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Technologies in declaration order.
    pub fn technologies(&self) -> &[Technology] {
        &self.technologies
    }

    pub fn get(&self, name: &str) -> Option<&Technology> {
        let name = canonical_name(name);
        self.technologies.iter().find(|t| t.name == name)
    }

    pub fn settings(&self, source: SourceTag) -> Option<&SourceSettings> {
        self.sources.get(&source)
    }

    pub fn is_enabled(&self, source: SourceTag) -> bool {
        self.sources.get(&source).is_some_and(|s| s.enabled)
    }

    /// Enabled, and at least one technology has an identifier for it.
    pub fn is_active(&self, source: SourceTag) -> bool {
        self.is_enabled(source) && self.technologies.iter().any(|t| t.identifier(source).is_some())
    }

    /// Technologies fetched from `source` in a run: empty when the source is
    /// disabled; otherwise those with an identifier for it.
    pub fn technologies_for(&self, source: SourceTag) -> Vec<Technology> {
        if !self.is_enabled(source) {
            return Vec::new();
        }
        self.technologies
            .iter()
            .filter(|t| t.identifier(source).is_some())
            .cloned()
            .collect()
    }

    pub fn keeps_metric(&self, source: SourceTag, metric: &str) -> bool {
        self.sources
            .get(&source)
            .is_some_and(|s| s.enabled && s.metrics.iter().any(|m| m == metric))
    }
}

fn validate_sources(section: &SourcesSection) -> Result<BTreeMap<SourceTag, SourceSettings>, ConfigError> {
    let mut out = BTreeMap::new();
    for tag in SourceTag::ALL {
        let declared = match tag {
            SourceTag::Github => section.github.as_ref(),
            SourceTag::Pypi => section.pypi.as_ref(),
        };
        let catalog = tag.metric_catalog();
        let settings = match declared {
            None => SourceSettings {
                enabled: true,
                metrics: catalog.iter().map(|m| m.to_string()).collect(),
            },
            Some(section) => {
                let metrics = match &section.metrics {
                    None => catalog.iter().map(|m| m.to_string()).collect(),
                    Some(listed) => {
                        let mut metrics = Vec::new();
                        for metric in listed {
                            let metric = metric.trim().to_string();
                            if !catalog.contains(&metric.as_str()) {
                                return Err(ConfigError::UnknownMetric { tag, metric });
                            }
                            if !metrics.contains(&metric) {
                                metrics.push(metric);
                            }
                        }
                        metrics
                    }
                };
                SourceSettings {
                    enabled: section.enabled,
                    metrics,
                }
            }
        };
        out.insert(tag, settings);
    }
    ensure_disjoint_metrics(&out)?;
    Ok(out)
}

/// A metric name may be produced by at most one enabled source, so a
/// technology's merged row never has to pick a winner.
pub(crate) fn ensure_disjoint_metrics(
    sources: &BTreeMap<SourceTag, SourceSettings>,
) -> Result<(), ConfigError> {
    let mut owner: BTreeMap<&str, SourceTag> = BTreeMap::new();
    for (tag, settings) in sources.iter().filter(|(_, s)| s.enabled) {
        for metric in &settings.metrics {
            if let Some(first) = owner.insert(metric.as_str(), *tag) {
                return Err(ConfigError::MetricCollision {
                    metric: metric.clone(),
                    first,
                    second: *tag,
                });
            }
        }
    }
    Ok(())
}

fn validate_technologies(entries: Vec<TechnologyEntry>) -> Result<Vec<Technology>, ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::EmptyRegistry);
    }

    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut out = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let invalid = |reason: String| ConfigError::InvalidTechnology { index, reason };

        let display_name = entry.name.trim().to_string();
        let name = canonical_name(&display_name);
        if name.is_empty() {
            return Err(invalid("name is empty".to_string()));
        }
        if let Some(first) = seen.insert(name.clone(), index) {
            return Err(ConfigError::DuplicateTechnology {
                name,
                first,
                second: index,
            });
        }

        let split_form = match (&entry.github_owner, &entry.github_repo) {
            (Some(owner), Some(repo)) => Some(format!("{}/{}", owner.trim(), repo.trim())),
            (None, None) => None,
            _ => {
                return Err(invalid(
                    "github_owner and github_repo must be given together".to_string(),
                ))
            }
        };
        let repository = match (entry.github.map(|g| g.trim().to_string()), split_form) {
            (Some(a), Some(b)) if a != b => {
                return Err(invalid(format!("github `{a}` disagrees with `{b}`")));
            }
            (Some(a), _) => Some(a),
            (None, b) => b,
        };
        if let Some(repository) = &repository {
            if split_repository(repository).is_none() {
                return Err(invalid(format!("`{repository}` is not an owner/repo path")));
            }
        }

        let package = match entry.pypi.map(|p| p.trim().to_string()) {
            Some(p) if p.is_empty() => return Err(invalid("pypi package is empty".to_string())),
            other => other,
        };

        out.push(Technology {
            name,
            display_name,
            github_repository: repository,
            pypi_package: package,
        });
    }
    Ok(out)
}

/// Pairs of distinct canonical names that are nearly identical.
pub fn near_duplicates(technologies: &[Technology]) -> Vec<(String, String, f64)> {
    let mut out = Vec::new();
    for (i, a) in technologies.iter().enumerate() {
        for b in &technologies[i + 1..] {
            let score = jaro_winkler(&a.name, &b.name);
            if score >= NEAR_DUPLICATE_THRESHOLD {
                out.push((a.name.clone(), b.name.clone(), score));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Registry, ConfigError> {
        Registry::from_yaml_str(text, Path::new("technologies.yaml"))
    }

    #[test]
    fn loads_both_identifier_forms_and_canonicalizes_names() {
        let registry = parse(
            r#"
technologies:
  - name: DuckDB
    github: duckdb/duckdb
    pypi: duckdb
  - name: Apache Kafka
    github_owner: apache
    github_repo: kafka
  - name: great_expectations
    pypi_package: great_expectations
"#,
        )
        .unwrap();

        let names: Vec<_> = registry.technologies().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["duckdb", "apache-kafka", "great-expectations"]);
        let kafka = registry.get("apache kafka").unwrap();
        assert_eq!(kafka.display_name, "Apache Kafka");
        assert_eq!(kafka.github_repository.as_deref(), Some("apache/kafka"));
        assert_eq!(kafka.pypi_package, None);

        assert_eq!(registry.technologies_for(SourceTag::Github).len(), 2);
        assert_eq!(registry.technologies_for(SourceTag::Pypi).len(), 2);
        assert!(registry.keeps_metric(SourceTag::Github, "stars"));
        assert!(registry.is_active(SourceTag::Pypi));
    }

    #[test]
    fn accepts_original_libraries_key_as_json() {
        let registry = parse(
            r#"{"libraries": [{"name": "polars", "github_owner": "pola-rs", "github_repo": "polars", "pypi_package": "polars"}]}"#,
        )
        .unwrap();
        assert_eq!(registry.technologies().len(), 1);
        assert_eq!(
            registry.technologies()[0].github_repository.as_deref(),
            Some("pola-rs/polars")
        );
    }

    #[test]
    fn duplicate_canonical_names_are_fatal() {
        let err = parse("technologies:\n  - name: DuckDB\n  - name: ' duckdb '\n").unwrap_err();
        match err {
            ConfigError::DuplicateTechnology { name, first, second } => {
                assert_eq!(name, "duckdb");
                assert_eq!((first, second), (0, 1));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn structural_problems_are_config_errors() {
        assert!(matches!(parse("technologies: []\n"), Err(ConfigError::EmptyRegistry)));
        assert!(matches!(parse("{}"), Err(ConfigError::EmptyRegistry)));
        assert!(matches!(parse("technologies: [1, 2"), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            parse("technologies:\n  - name: ''\n"),
            Err(ConfigError::InvalidTechnology { index: 0, .. })
        ));
        assert!(matches!(
            parse("technologies:\n  - name: x\n    github: just-a-name\n"),
            Err(ConfigError::InvalidTechnology { .. })
        ));
        assert!(matches!(
            parse("technologies:\n  - name: x\n    github_owner: apache\n"),
            Err(ConfigError::InvalidTechnology { .. })
        ));
        assert!(matches!(
            parse("technologies:\n  - name: x\n    pypi: '  '\n"),
            Err(ConfigError::InvalidTechnology { .. })
        ));
    }

    #[test]
    fn metric_projection_is_checked_against_the_catalog() {
        let registry = parse(
            "sources:\n  pypi:\n    metrics: [downloads_last_month]\ntechnologies:\n  - name: duckdb\n    pypi: duckdb\n",
        )
        .unwrap();
        assert!(registry.keeps_metric(SourceTag::Pypi, "downloads_last_month"));
        assert!(!registry.keeps_metric(SourceTag::Pypi, "downloads_last_year"));

        let err = parse(
            "sources:\n  github:\n    metrics: [stars, downloads_last_month]\ntechnologies:\n  - name: duckdb\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownMetric { tag: SourceTag::Github, ref metric } if metric == "downloads_last_month"
        ));
    }

    #[test]
    fn overlapping_enabled_metrics_collide() {
        let settings = |metrics: &[&str], enabled: bool| SourceSettings {
            enabled,
            metrics: metrics.iter().map(|m| m.to_string()).collect(),
        };
        let mut sources = BTreeMap::new();
        sources.insert(SourceTag::Github, settings(&["stars", "language"], true));
        sources.insert(SourceTag::Pypi, settings(&["language"], true));
        assert!(matches!(
            ensure_disjoint_metrics(&sources),
            Err(ConfigError::MetricCollision { first: SourceTag::Github, second: SourceTag::Pypi, .. })
        ));

        sources.insert(SourceTag::Pypi, settings(&["language"], false));
        assert!(ensure_disjoint_metrics(&sources).is_ok());
    }

    #[test]
    fn disabled_source_fetches_nothing() {
        let registry = parse(
            "sources:\n  github: { enabled: false }\ntechnologies:\n  - name: duckdb\n    github: duckdb/duckdb\n",
        )
        .unwrap();
        assert!(registry.technologies_for(SourceTag::Github).is_empty());
        assert!(!registry.is_active(SourceTag::Github));
        assert!(!registry.keeps_metric(SourceTag::Github, "stars"));
    }

    #[test]
    fn near_duplicate_names_are_reported() {
        let techs = vec![
            Technology::new("polars"),
            Technology::new("polar"),
            Technology::new("duckdb"),
        ];
        let pairs = near_duplicates(&techs);
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].0.as_str(), pairs[0].1.as_str()), ("polars", "polar"));
    }

    #[tokio::test]
    async fn repository_sample_registry_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../technologies.yaml");
        let registry = Registry::load(&path).await.unwrap();
        assert_eq!(registry.technologies().len(), 10);
        let kafka = registry.get("Apache Kafka").unwrap();
        assert_eq!(kafka.github_repository.as_deref(), Some("apache/kafka"));
        assert!(kafka.pypi_package.is_none());
        assert_eq!(registry.technologies_for(SourceTag::Pypi).len(), 9);
    }
}
