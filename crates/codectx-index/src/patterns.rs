//! Architecture and style pattern learning.
//!
//! The learner looks at the symbol index, the import graph and a sample of
//! stored chunks, and produces a [`PatternSnapshot`]: path clusters that
//! match a known architectural shape, and the dominant coding conventions.
//! Search consults the snapshot as additive score boosts.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use codectx_config::PatternsConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunker::Chunk;
use crate::graph::ImportGraph;
use crate::languages::SymbolKind;
use crate::search::SearchHit;
use crate::symbols::SymbolIndex;

/// At most this many hub clusters are kept.
const MAX_HUBS: usize = 5;
const MAX_EXAMPLES: usize = 3;

/// Known architectural shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterShape {
    /// controller / service / repository
    Layered,
    /// UI components plus `use*` hooks
    ComponentHook,
    /// domain / application / infrastructure
    DomainLayers,
    /// A module many files import
    Hub,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureCluster {
    pub name: String,
    pub shape: ClusterShape,
    pub members: Vec<String>,
    /// 0..=1
    pub confidence: f32,
    /// Query keywords that activate the boost
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StyleCategory {
    Naming,
    Indentation,
    Quotes,
}

impl StyleCategory {
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Naming => &["naming", "name", "names", "convention", "case", "camel", "snake", "pascal"],
            Self::Indentation => &["indent", "indentation", "tabs", "spaces", "format", "formatting", "whitespace"],
            Self::Quotes => &["import", "imports", "quote", "quotes", "require", "string"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleObservation {
    pub category: StyleCategory,
    pub value: String,
    /// Share of observations that agree, 0..=1
    pub frequency: f32,
    pub examples: Vec<String>,
}

/// Persisted learner output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clusters: Vec<ArchitectureCluster>,
    #[serde(default)]
    pub style: Vec<StyleObservation>,
}

impl PatternSnapshot {
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty() && self.style.is_empty()
    }

    /// Add boosts for clusters and style observations matching the query.
    /// Returns whether any hit changed.
    pub fn boost(&self, hits: &mut [SearchHit], query_terms: &[String], weight: f32) -> bool {
        if weight <= 0.0 || query_terms.is_empty() || hits.is_empty() {
            return false;
        }
        let mut changed = false;

        for cluster in &self.clusters {
            if !cluster.tags.iter().any(|t| term_matches(query_terms, t)) {
                continue;
            }
            let members: BTreeSet<&str> = cluster.members.iter().map(String::as_str).collect();
            for hit in hits.iter_mut().filter(|h| members.contains(h.path.as_str())) {
                hit.score += weight * cluster.confidence;
                changed = true;
            }
        }

        for obs in &self.style {
            if !obs.category.keywords().iter().any(|k| term_matches(query_terms, k)) {
                continue;
            }
            for hit in hits.iter_mut() {
                if obs.examples.iter().any(|e| hit.snippet.contains(e.as_str())) {
                    hit.score += weight / 2.0 * obs.frequency;
                    changed = true;
                }
            }
        }
        changed
    }
}

fn term_matches(terms: &[String], tag: &str) -> bool {
    terms.iter().any(|t| {
        t == tag || (t.len() >= 4 && tag.len() >= 4 && (t.starts_with(tag) || tag.starts_with(t.as_str())))
    })
}

pub struct PatternLearner {
    architecture: bool,
    style: bool,
}

impl PatternLearner {
    pub fn new(config: &PatternsConfig) -> Self {
        Self {
            architecture: config.enabled && config.architecture,
            style: config.enabled && config.style,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.architecture || self.style
    }

    pub fn learn(
        &self,
        symbols: &SymbolIndex,
        graph: &ImportGraph,
        files: &[String],
        sample: &[Chunk],
    ) -> PatternSnapshot {
        let mut snapshot = PatternSnapshot {
            generated_at: Some(Utc::now()),
            ..Default::default()
        };
        if self.architecture {
            snapshot.clusters.extend(layered_clusters(files));
            snapshot.clusters.extend(component_hook_cluster(symbols, files));
            snapshot.clusters.extend(hub_clusters(graph, files.len()));
        }
        if self.style {
            snapshot.style.extend(naming_style(symbols));
            snapshot.style.extend(indentation_style(sample));
            snapshot.style.extend(quote_style(sample));
        }
        debug!(
            "Learned {} clusters, {} style observations",
            snapshot.clusters.len(),
            snapshot.style.len()
        );
        snapshot
    }
}

/// Lowercased path segments plus the file stem.
fn path_words(path: &str) -> Vec<String> {
    let lower = path.to_lowercase();
    let mut words: Vec<String> = lower.split('/').map(str::to_string).collect();
    if let Some(stem) = Path::new(&lower).file_stem().and_then(|s| s.to_str()) {
        words.extend(stem.split(|c: char| c == '.' || c == '_' || c == '-').map(str::to_string));
    }
    words
}

fn has_role(words: &[String], keys: &[&str]) -> bool {
    words.iter().any(|w| keys.iter().any(|k| w.starts_with(k)))
}

/// Fraction of files in the cluster, scaled so a quarter of the tree is full coverage.
fn coverage(members: usize, total: usize) -> f32 {
    if total == 0 {
        return 0.0;
    }
    (members as f32 / total as f32 * 4.0).min(1.0)
}

fn role_cluster(
    name: &str,
    shape: ClusterShape,
    files: &[String],
    roles: &[&[&str]],
    tags: &[&str],
) -> Option<ArchitectureCluster> {
    let mut members = BTreeSet::new();
    let mut present = 0usize;
    for keys in roles {
        let matched: Vec<&String> = files
            .iter()
            .filter(|f| has_role(&path_words(f), keys))
            .collect();
        if !matched.is_empty() {
            present += 1;
            members.extend(matched.into_iter().cloned());
        }
    }
    // One role alone is not a layering.
    if present < 2 {
        return None;
    }
    let completeness = present as f32 / roles.len() as f32;
    let confidence = (completeness * coverage(members.len(), files.len())).clamp(0.0, 1.0);
    Some(ArchitectureCluster {
        name: name.to_string(),
        shape,
        members: members.into_iter().collect(),
        confidence,
        tags: tags.iter().map(|t| t.to_string()).collect(),
    })
}

fn layered_clusters(files: &[String]) -> Vec<ArchitectureCluster> {
    let layered = role_cluster(
        "controller-service-repository",
        ClusterShape::Layered,
        files,
        &[
            &["controller", "handler", "route", "endpoint"],
            &["service"],
            &["repositor", "repo", "dao", "store", "model"],
        ],
        &["controller", "service", "repository", "handler", "route", "endpoint", "layer", "api", "database", "persistence"],
    );
    let domain = role_cluster(
        "domain-application-infrastructure",
        ClusterShape::DomainLayers,
        files,
        &[
            &["domain", "entity", "entities"],
            &["application", "usecase", "use_case"],
            &["infrastructure", "infra", "adapter"],
        ],
        &["domain", "application", "infrastructure", "entity", "usecase", "adapter", "ddd", "layer"],
    );
    layered.into_iter().chain(domain).collect()
}

fn component_hook_cluster(symbols: &SymbolIndex, files: &[String]) -> Option<ArchitectureCluster> {
    let mut components = BTreeSet::new();
    let mut hooks = BTreeSet::new();
    for symbol in symbols.all() {
        let is_ui_file = symbol.path.ends_with(".tsx") || symbol.path.ends_with(".jsx");
        let in_components = symbol.path.contains("components/");
        let pascal = symbol.name.chars().next().is_some_and(|c| c.is_uppercase());
        if symbol.kind == SymbolKind::Function && is_hook_name(&symbol.name) {
            hooks.insert(symbol.path.clone());
        } else if symbol.exported
            && pascal
            && matches!(symbol.kind, SymbolKind::Function | SymbolKind::Class)
            && (is_ui_file || in_components)
        {
            components.insert(symbol.path.clone());
        }
    }
    if components.is_empty() || hooks.is_empty() {
        return None;
    }
    let members: BTreeSet<String> = components.union(&hooks).cloned().collect();
    let confidence = coverage(members.len(), files.len()).clamp(0.0, 1.0);
    Some(ArchitectureCluster {
        name: "components-hooks".to_string(),
        shape: ClusterShape::ComponentHook,
        members: members.into_iter().collect(),
        confidence,
        tags: ["component", "components", "hook", "hooks", "ui", "react", "view", "render", "state", "props"]
            .iter()
            .map(|t| t.to_string())
            .collect(),
    })
}

fn is_hook_name(name: &str) -> bool {
    name.strip_prefix("use")
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_uppercase())
}

fn hub_clusters(graph: &ImportGraph, total_files: usize) -> Vec<ArchitectureCluster> {
    let threshold = 3usize.max((total_files as f32 * 0.1).ceil() as usize);
    let mut hubs: Vec<(&str, usize)> = graph
        .fan_in()
        .into_iter()
        .filter(|(_, n)| *n >= threshold)
        .collect();
    hubs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    hubs.truncate(MAX_HUBS);

    hubs.into_iter()
        .map(|(file, fan_in)| {
            let mut members: BTreeSet<String> =
                graph.importers_of(file).into_iter().map(str::to_string).collect();
            members.insert(file.to_string());
            let mut tags: Vec<String> = ["hub", "core", "shared", "common", "central"]
                .iter()
                .map(|t| t.to_string())
                .collect();
            if let Some(stem) = Path::new(file).file_stem().and_then(|s| s.to_str()) {
                let stem = stem.to_lowercase();
                if !tags.contains(&stem) {
                    tags.push(stem);
                }
            }
            ArchitectureCluster {
                name: format!("hub:{file}"),
                shape: ClusterShape::Hub,
                members: members.into_iter().collect(),
                confidence: (fan_in as f32 / (2 * threshold) as f32).clamp(0.0, 1.0),
                tags,
            }
        })
        .collect()
}

/// Picks the winning value of a vote, ties broken by name.
fn dominant(
    category: StyleCategory,
    votes: BTreeMap<&'static str, (usize, Vec<String>)>,
) -> Option<StyleObservation> {
    let total: usize = votes.values().map(|(n, _)| *n).sum();
    if total == 0 {
        return None;
    }
    let (value, (count, examples)) = votes
        .into_iter()
        .max_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| b.0.cmp(a.0)))?;
    Some(StyleObservation {
        category,
        value: value.to_string(),
        frequency: count as f32 / total as f32,
        examples,
    })
}

fn vote(votes: &mut BTreeMap<&'static str, (usize, Vec<String>)>, key: &'static str, example: &str) {
    let entry = votes.entry(key).or_default();
    entry.0 += 1;
    if entry.1.len() < MAX_EXAMPLES && !entry.1.iter().any(|e| e == example) {
        entry.1.push(example.to_string());
    }
}

fn naming_style(symbols: &SymbolIndex) -> Option<StyleObservation> {
    let mut votes = BTreeMap::new();
    for symbol in symbols.all().filter(|s| s.kind.is_callable()) {
        let name = symbol.name.trim_start_matches('_');
        let Some(first) = name.chars().next() else {
            continue;
        };
        let has_upper = name.chars().skip(1).any(|c| c.is_uppercase());
        let has_lower = name.chars().any(|c| c.is_lowercase());
        let key = if name.contains('_') && !name.chars().any(|c| c.is_uppercase()) {
            "snake_case"
        } else if first.is_lowercase() && has_upper && !name.contains('_') {
            "camelCase"
        } else if first.is_uppercase() && has_lower && !name.contains('_') {
            "PascalCase"
        } else {
            continue;
        };
        vote(&mut votes, key, &symbol.name);
    }
    dominant(StyleCategory::Naming, votes)
}

fn indentation_style(sample: &[Chunk]) -> Option<StyleObservation> {
    let mut votes = BTreeMap::new();
    for chunk in sample {
        let mut tabs = 0usize;
        let mut widths = Vec::new();
        let mut example = None;
        for line in chunk.text.lines().filter(|l| !l.trim().is_empty()) {
            if line.starts_with('\t') {
                tabs += 1;
                example.get_or_insert(line);
            } else {
                let width = line.len() - line.trim_start_matches(' ').len();
                if width > 0 {
                    widths.push(width);
                    example.get_or_insert(line);
                }
            }
        }
        let key = if tabs > widths.len() {
            "tabs"
        } else if widths.is_empty() {
            continue;
        } else if widths.iter().any(|w| w % 4 != 0) {
            "2 spaces"
        } else {
            "4 spaces"
        };
        if let Some(line) = example {
            vote(&mut votes, key, line.trim_end());
        }
    }
    dominant(StyleCategory::Indentation, votes)
}

fn quote_style(sample: &[Chunk]) -> Option<StyleObservation> {
    let mut votes = BTreeMap::new();
    for chunk in sample {
        for line in chunk.text.lines() {
            let trimmed = line.trim();
            let is_import = trimmed.starts_with("import ")
                || trimmed.starts_with("from ")
                || trimmed.contains("require(")
                || (trimmed.starts_with("export ") && trimmed.contains(" from "));
            if !is_import {
                continue;
            }
            let single = trimmed.find('\'');
            let double = trimmed.find('"');
            let key = match (single, double) {
                (Some(s), Some(d)) if s < d => "single",
                (Some(_), None) => "single",
                (_, Some(_)) => "double",
                (None, None) => continue,
            };
            vote(&mut votes, key, trimmed);
        }
    }
    dominant(StyleCategory::Quotes, votes)
}
