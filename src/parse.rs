//! Extraction of the topic catalog and of a topic's dimension tables.
//!
//! Topics come from the catalog page's menu (`li.menySol` entries followed by
//! a `li.menyText` description). Dimension values are not in the markup; the
//! topic page declares them in script arrays such as
//! `arrayRegionNivaTva[3]="1480*Göteborg*14"`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::dimension::{DimensionSet, TopicId};
use crate::{Error, Result};

static DIMENSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"array(Nivaett|Nivatva|RegionNivaEtt|RegionNivaTva|Period)\[\d+\]="([^"]*)""#)
        .expect("valid dimension regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub description: String,
}

/// One selectable value of a dimension as declared on the topic page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionEntry {
    pub id: String,
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDimensions {
    pub crime: Vec<DimensionEntry>,
    pub region: Vec<DimensionEntry>,
    pub period: Vec<DimensionEntry>,
}

impl TopicDimensions {
    /// Query space of the topic: its crime, region and period ids plus the measures.
    pub fn dimension_set(&self) -> Result<DimensionSet> {
        let ids = |entries: &[DimensionEntry]| entries.iter().map(|e| e.id.clone()).collect();
        DimensionSet::for_topic(ids(&self.crime), ids(&self.region), ids(&self.period))
    }
}

/// Topics and their dimension tables, cached on disk between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub topics: Vec<Topic>,
    pub dimensions: BTreeMap<TopicId, TopicDimensions>,
}

impl Catalog {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn topic_ids(&self) -> Vec<TopicId> {
        self.topics.iter().map(|t| t.id).collect()
    }

    pub fn dimension_set(&self, topic: TopicId) -> Result<DimensionSet> {
        self.dimensions
            .get(&topic)
            .ok_or(Error::UnknownTopic(topic.0))?
            .dimension_set()
    }
}

/// Parses the catalog page into topics sorted by id.
pub fn parse_topics(html: &str) -> Result<Vec<Topic>> {
    let doc = Html::parse_document(html);
    let item_selector = create_selector("li")?;
    let link_selector = create_selector(r#"a[href*="menyid="]"#)?;
    let name_selector = create_selector("span.menytext")?;

    let mut topics: Vec<Topic> = Vec::new();
    for item in doc.select(&item_selector) {
        let is = |class: &str| item.value().classes().any(|c| c == class);

        if is("menySol") {
            let Some(link) = item.select(&link_selector).next() else {
                continue;
            };
            let id = link
                .value()
                .attr("href")
                .and_then(|href| href.rsplit("menyid=").next())
                .and_then(|id| id.trim().parse::<u32>().ok());
            let Some(id) = id else {
                continue;
            };
            let name = link
                .select(&name_selector)
                .next()
                .map_or_else(|| link.text().collect::<String>(), |span| span.text().collect());

            topics.push(Topic {
                id: TopicId(id),
                name: clean_text(&name),
                description: String::new(),
            });
        } else if is("menyText") {
            if let Some(topic) = topics.last_mut().filter(|t| t.description.is_empty()) {
                topic.description = clean_text(&item.text().collect::<String>());
            }
        }
    }

    topics.sort_by_key(|t| t.id);
    Ok(topics)
}

/// Parses the dimension arrays declared in a topic page's scripts.
///
/// Both hierarchy levels are merged; an id seen twice keeps its first
/// position and collects the labels of every declaration.
pub fn parse_dimensions(html: &str) -> TopicDimensions {
    let mut dims = TopicDimensions::default();

    for cap in DIMENSION_RE.captures_iter(html) {
        let is_period = &cap[1] == "Period";
        let entries = match &cap[1] {
            "Nivaett" | "Nivatva" => &mut dims.crime,
            "RegionNivaEtt" | "RegionNivaTva" => &mut dims.region,
            _ => &mut dims.period,
        };

        let line = cap[2].replace("\\xA0", "");
        let mut parts = line.trim().split('*').map(str::trim);
        let Some(id) = parts.next().filter(|id| !id.is_empty()) else {
            continue;
        };
        let rest: Vec<&str> = parts.collect();

        let labels = rest
            .iter()
            .filter(|p| !p.is_empty() && !is_numeric(p))
            .map(|p| p.to_string());
        let parent = if is_period {
            None
        } else {
            rest.iter()
                .find(|p| is_numeric(p) && **p != id)
                .map(|p| p.to_string())
        };

        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                for label in labels {
                    if !entry.labels.contains(&label) {
                        entry.labels.push(label);
                    }
                }
                if parent.is_some() {
                    entry.parent = parent;
                }
            }
            None => {
                let mut unique: Vec<String> = Vec::new();
                for label in labels {
                    if !unique.contains(&label) {
                        unique.push(label);
                    }
                }
                entries.push(DimensionEntry {
                    id: id.to_string(),
                    labels: unique,
                    parent,
                });
            }
        }
    }
    dims
}

#[inline]
fn create_selector(sel_str: &str) -> Result<Selector> {
    Selector::parse(sel_str).map_err(|_| Error::ParseMissingSelector(sel_str.into()))
}

#[inline]
fn is_numeric(part: &str) -> bool {
    !part.is_empty() && part.chars().all(|c| c.is_ascii_digit())
}

/// Collapses whitespace, including non-breaking spaces and `&nbsp;` leftovers.
fn clean_text(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
