use std::collections::BTreeMap;
use std::fmt;

/// A single typed option forwarded to the producer when evaluating a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    /// List of numeric pairs, e.g. a frame rate as `[(30000, 1001)]`.
    Pairs(Vec<(i64, i64)>),
}

impl OptionValue {
    /// Interprets a raw command-line value: integers, `a/b` pairs
    /// (comma-separated for more than one) and otherwise plain strings.
    pub fn parse(raw: &str) -> Self {
        if let Ok(n) = raw.trim().parse::<i64>() {
            return Self::Int(n);
        }
        let pairs: Option<Vec<(i64, i64)>> = raw
            .split(',')
            .map(|part| {
                let (a, b) = part.split_once('/')?;
                Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
            })
            .collect();
        match pairs {
            Some(pairs) if !pairs.is_empty() => Self::Pairs(pairs),
            _ => Self::Str(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_pair(&self) -> Option<(i64, i64)> {
        match self {
            Self::Pairs(pairs) => pairs.first().copied(),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(n) => write!(f, "{n}"),
            Self::Pairs(pairs) => {
                let parts: Vec<String> = pairs.iter().map(|(a, b)| format!("{a}/{b}")).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Identifies what the producer should evaluate, plus its options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceDescriptor {
    source: String,
    options: BTreeMap<String, OptionValue>,
}

impl SourceDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: OptionValue) -> Self {
        self.set_option(name, value);
        self
    }

    pub fn set_option(&mut self, name: impl Into<String>, value: OptionValue) {
        self.options.insert(name.into(), value);
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn option(&self, name: &str) -> Option<&OptionValue> {
        self.options.get(name)
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Integer option, or `None` when absent or not an integer.
    pub fn int_option(&self, name: &str) -> Option<i64> {
        self.option(name).and_then(OptionValue::as_int)
    }
}
