use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const START_MARKER: &str = "/*---";
const END_MARKER: &str = "---*/";

/// Flag that disables the automatic `assert.js`/`sta.js` includes.
pub const RAW_FLAG: &str = "raw";
/// Flag requiring the test to run as strict-mode code.
pub const ONLY_STRICT_FLAG: &str = "onlyStrict";
/// Flag for tests that signal completion through `$DONE`.
pub const ASYNC_FLAG: &str = "async";

/// Declarative test262 metadata from the YAML header.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
  #[serde(default, deserialize_with = "string_or_set")]
  pub flags: BTreeSet<String>,
  #[serde(default, deserialize_with = "string_or_seq")]
  pub includes: Vec<String>,
  #[serde(default, deserialize_with = "string_or_seq")]
  pub features: Vec<String>,
  #[serde(default)]
  pub negative: Option<Negative>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Negative {
  pub phase: String,
  #[serde(rename = "type")]
  pub typ: String,
}

impl Metadata {
  pub fn has_flag(&self, flag: &str) -> bool {
    self.flags.contains(flag)
  }
}

/// Extracts the `/*--- ... ---*/` header from a test source.
///
/// A missing or malformed header yields empty metadata: it means the test
/// declared no special requirements, not that the test is broken.
pub fn extract(source: &str) -> Metadata {
  let Some(yaml) = header(source) else {
    return Metadata::default();
  };

  match serde_yaml::from_str::<Option<Metadata>>(yaml) {
    Ok(metadata) => metadata.unwrap_or_default(),
    Err(err) => {
      tracing::debug!(%err, "ignoring unparseable test262 frontmatter");
      Metadata::default()
    }
  }
}

fn header(source: &str) -> Option<&str> {
  let source = source.strip_prefix('\u{feff}').unwrap_or(source);
  let start = source.find(START_MARKER)? + START_MARKER.len();
  let len = source[start..].find(END_MARKER)?;
  Some(&source[start..start + len])
}

fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
  D: serde::de::Deserializer<'de>,
{
  struct Visitor;

  impl<'de> serde::de::Visitor<'de> for Visitor {
    type Value = Vec<String>;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
      formatter.write_str("string or sequence of strings")
    }

    fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
    where
      E: serde::de::Error,
    {
      Ok(vec![v.to_string()])
    }

    fn visit_unit<E>(self) -> std::result::Result<Self::Value, E>
    where
      E: serde::de::Error,
    {
      Ok(Vec::new())
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
    where
      A: serde::de::SeqAccess<'de>,
    {
      let mut out = Vec::new();
      while let Some(value) = seq.next_element::<String>()? {
        out.push(value);
      }
      Ok(out)
    }
  }

  deserializer.deserialize_any(Visitor)
}

fn string_or_set<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
  D: serde::de::Deserializer<'de>,
{
  string_or_seq(deserializer).map(|flags| flags.into_iter().collect())
}
