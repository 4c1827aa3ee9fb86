use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Note, NoteId};

/// A NIP-01 REQ filter.
///
/// Tag constraints live in `tags`, keyed by their wire name (`"#e"`,
/// `"#p"`, ...), and are flattened into the filter object on the wire.
#[derive(Serialize, Deserialize, Debug, Default, Eq, PartialEq, Clone)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<NoteId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u64>>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>, // unix timestamp seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = NoteId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u64>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Constrain on a single-letter tag, e.g. `tag('e', [id])` becomes `"#e"`.
    pub fn tag(mut self, name: char, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.insert(
            format!("#{name}"),
            values.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The names of the fields this filter constrains. `since` and `until`
    /// carry their value (`"since:1700000000"`) because filters with
    /// different time windows must never share a REQ.
    pub fn field_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.ids.is_some() {
            names.push("ids".to_owned());
        }
        if self.authors.is_some() {
            names.push("authors".to_owned());
        }
        if self.kinds.is_some() {
            names.push("kinds".to_owned());
        }
        names.extend(self.tags.keys().cloned());
        if let Some(since) = self.since {
            names.push(format!("since:{since}"));
        }
        if let Some(until) = self.until {
            names.push(format!("until:{until}"));
        }
        if self.limit.is_some() {
            names.push("limit".to_owned());
        }
        if self.search.is_some() {
            names.push("search".to_owned());
        }
        names
    }

    /// Fold `other` into this filter: array fields become the
    /// order-preserving union, scalar fields present in `other` win.
    pub fn absorb(&mut self, other: &Filter) {
        union_into(&mut self.ids, &other.ids);
        union_into(&mut self.authors, &other.authors);
        union_into(&mut self.kinds, &other.kinds);

        for (key, values) in &other.tags {
            let ours = self.tags.entry(key.clone()).or_default();
            for value in values {
                if !ours.contains(value) {
                    ours.push(value.clone());
                }
            }
        }

        if other.since.is_some() {
            self.since = other.since;
        }
        if other.until.is_some() {
            self.until = other.until;
        }
        if other.limit.is_some() {
            self.limit = other.limit;
        }
        if other.search.is_some() {
            self.search.clone_from(&other.search);
        }
    }

    /// NIP-01 matching. `search` is relay-side only and ignored here.
    pub fn matches(&self, note: &Note) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&note.id) {
                return false;
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| *a == note.pubkey) {
                return false;
            }
        }

        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&note.kind) {
                return false;
            }
        }

        if self.since.is_some_and(|since| note.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| note.created_at > until) {
            return false;
        }

        for (key, wanted) in &self.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };

            let mut values = note.tag_values(name);
            if !values.any(|v| wanted.iter().any(|w| w == v)) {
                return false;
            }
        }

        true
    }
}

fn union_into<T: PartialEq + Clone>(ours: &mut Option<Vec<T>>, theirs: &Option<Vec<T>>) {
    let Some(theirs) = theirs else {
        return;
    };

    match ours {
        Some(ours) => {
            for item in theirs {
                if !ours.contains(item) {
                    ours.push(item.clone());
                }
            }
        }
        None => *ours = Some(theirs.clone()),
    }
}
