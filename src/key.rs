//! Cache entry identifiers.
//!
//! A [`CacheEngineKey`] names one chunk of KV cache produced by one worker of
//! one model. Its canonical string form is
//!
//! ```text
//! fmt@model_name@world_size@worker_id@chunk_hash[@layer_id]{@tag%value}*
//! ```
//!
//! Two keys are equal exactly when their canonical strings are equal, so tag
//! order is significant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const FIELD_SEP: char = '@';
const TAG_SEP: char = '%';
const MIN_FIELDS: usize = 5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("Invalid key string {input:?}: {reason}")]
    InvalidString { input: String, reason: String },

    #[error("Invalid key dict {input}: {reason}")]
    InvalidDict { input: String, reason: String },

    #[error("Invalid key {field} {value:?}: must not contain '{forbidden}'")]
    InvalidField {
        field: &'static str,
        value: String,
        forbidden: char,
    },
}

impl KeyParseError {
    fn string(input: &str, reason: impl Into<String>) -> Self {
        KeyParseError::InvalidString {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Identifier of a cached chunk, optionally qualified by a layer.
///
/// Keys are immutable; the builder-style methods return new keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "KeyRepr", try_from = "KeyRepr")]
pub struct CacheEngineKey {
    fmt: String,
    model_name: String,
    world_size: u32,
    worker_id: u32,
    chunk_hash: i64,
    /// Ordered tag pairs. Never `Some(empty)`.
    tags: Option<Vec<(String, String)>>,
    layer_id: Option<u32>,
}

impl CacheEngineKey {
    /// Fails if `fmt` or `model_name` contains `@`.
    pub fn new(
        fmt: impl Into<String>,
        model_name: impl Into<String>,
        world_size: u32,
        worker_id: u32,
        chunk_hash: i64,
    ) -> Result<Self, KeyParseError> {
        let fmt = fmt.into();
        let model_name = model_name.into();
        check_positional("fmt", &fmt)?;
        check_positional("model_name", &model_name)?;
        Ok(Self {
            fmt,
            model_name,
            world_size,
            worker_id,
            chunk_hash,
            tags: None,
            layer_id: None,
        })
    }

    /// Attach tags. Re-using a tag name overwrites its value in place.
    ///
    /// Names may not contain `@` or `%`, values may not contain `@`.
    pub fn with_tags<K, V>(
        mut self,
        tags: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self, KeyParseError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.tags.take().unwrap_or_default();
        for (k, v) in tags {
            let (k, v) = (k.into(), v.into());
            check_tag(&k, &v)?;
            insert_tag(&mut merged, k, v);
        }
        self.tags = if merged.is_empty() { None } else { Some(merged) };
        Ok(self)
    }

    /// The same chunk, qualified by `layer_id`.
    pub fn with_layer(&self, layer_id: u32) -> Self {
        Self {
            layer_id: Some(layer_id),
            ..self.clone()
        }
    }

    pub fn fmt(&self) -> &str {
        &self.fmt
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn chunk_hash(&self) -> i64 {
        self.chunk_hash
    }

    pub fn tags(&self) -> Option<&[(String, String)]> {
        self.tags.as_deref()
    }

    pub fn layer_id(&self) -> Option<u32> {
        self.layer_id
    }

    /// Expand into one key per layer, `0..num_layers`.
    pub fn split_layers(&self, num_layers: usize) -> Vec<CacheEngineKey> {
        (0..num_layers as u32)
            .map(|layer| self.with_layer(layer))
            .collect()
    }

    /// Equivalent to `split_layers(1)[0]`.
    pub fn get_first_layer(&self) -> CacheEngineKey {
        self.with_layer(0)
    }

    /// Parse the canonical string form.
    ///
    /// A sixth positional field without a `%` is the layer id; every other
    /// trailing field must be a `name%value` tag.
    pub fn from_string(s: &str) -> Result<Self, KeyParseError> {
        let parts: Vec<&str> = s.split(FIELD_SEP).collect();
        if parts.len() < MIN_FIELDS {
            return Err(KeyParseError::string(
                s,
                format!("expected at least {MIN_FIELDS} fields, got {}", parts.len()),
            ));
        }

        let world_size = parse_int::<u32>(s, "world_size", parts[2])?;
        let worker_id = parse_int::<u32>(s, "worker_id", parts[3])?;
        let chunk_hash = parse_int::<i64>(s, "chunk_hash", parts[4])?;

        let mut rest = &parts[MIN_FIELDS..];
        let mut layer_id = None;
        if let Some(first) = rest.first() {
            if !first.contains(TAG_SEP) {
                layer_id = Some(parse_int::<u32>(s, "layer_id", first)?);
                rest = &rest[1..];
            }
        }

        let mut tags = Vec::new();
        for segment in rest {
            let (k, v) = segment
                .split_once(TAG_SEP)
                .ok_or_else(|| KeyParseError::string(s, format!("tag {segment:?} lacks '%'")))?;
            insert_tag(&mut tags, k.to_string(), v.to_string());
        }

        Ok(Self {
            fmt: parts[0].to_string(),
            model_name: parts[1].to_string(),
            world_size,
            worker_id,
            chunk_hash,
            tags: if tags.is_empty() { None } else { Some(tags) },
            layer_id,
        })
    }
}

fn check_positional(field: &'static str, value: &str) -> Result<(), KeyParseError> {
    if value.contains(FIELD_SEP) {
        return Err(KeyParseError::InvalidField {
            field,
            value: value.to_string(),
            forbidden: FIELD_SEP,
        });
    }
    Ok(())
}

fn check_tag(name: &str, value: &str) -> Result<(), KeyParseError> {
    for forbidden in [FIELD_SEP, TAG_SEP] {
        if name.contains(forbidden) {
            return Err(KeyParseError::InvalidField {
                field: "tag name",
                value: name.to_string(),
                forbidden,
            });
        }
    }
    if value.contains(FIELD_SEP) {
        return Err(KeyParseError::InvalidField {
            field: "tag value",
            value: value.to_string(),
            forbidden: FIELD_SEP,
        });
    }
    Ok(())
}

fn insert_tag(tags: &mut Vec<(String, String)>, k: String, v: String) {
    match tags.iter_mut().find(|(name, _)| *name == k) {
        Some(slot) => slot.1 = v,
        None => tags.push((k, v)),
    }
}

fn parse_int<T: FromStr>(input: &str, field: &str, raw: &str) -> Result<T, KeyParseError> {
    raw.parse()
        .map_err(|_| KeyParseError::string(input, format!("{field} {raw:?} is not an integer")))
}

impl fmt::Display for CacheEngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}@{}@{}@{}",
            self.fmt, self.model_name, self.world_size, self.worker_id, self.chunk_hash
        )?;
        if let Some(layer) = self.layer_id {
            write!(f, "@{layer}")?;
        }
        for (k, v) in self.tags.iter().flatten() {
            write!(f, "@{k}%{v}")?;
        }
        Ok(())
    }
}

impl FromStr for CacheEngineKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

/// Structured (non-string) form used on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRepr {
    fmt: String,
    model_name: String,
    world_size: u32,
    worker_id: u32,
    chunk_hash: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    layer_id: Option<u32>,
}

impl From<CacheEngineKey> for KeyRepr {
    fn from(key: CacheEngineKey) -> Self {
        KeyRepr {
            tags: key
                .tags
                .map(|tags| tags.into_iter().map(|(k, v)| format!("{k}%{v}")).collect()),
            fmt: key.fmt,
            model_name: key.model_name,
            world_size: key.world_size,
            worker_id: key.worker_id,
            chunk_hash: key.chunk_hash,
            layer_id: key.layer_id,
        }
    }
}

impl TryFrom<KeyRepr> for CacheEngineKey {
    type Error = KeyParseError;

    fn try_from(repr: KeyRepr) -> Result<Self, Self::Error> {
        let mut tags = Vec::new();
        for kv in repr.tags.iter().flatten() {
            let (k, v) = kv.split_once(TAG_SEP).ok_or_else(|| KeyParseError::InvalidDict {
                input: format!("{repr:?}"),
                reason: format!("tag {kv:?} lacks '%'"),
            })?;
            check_tag(k, v)?;
            insert_tag(&mut tags, k.to_string(), v.to_string());
        }
        check_positional("fmt", &repr.fmt)?;
        check_positional("model_name", &repr.model_name)?;
        Ok(CacheEngineKey {
            fmt: repr.fmt,
            model_name: repr.model_name,
            world_size: repr.world_size,
            worker_id: repr.worker_id,
            chunk_hash: repr.chunk_hash,
            tags: if tags.is_empty() { None } else { Some(tags) },
            layer_id: repr.layer_id,
        })
    }
}
