use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid run id '{0}': expected p<NN>-r<NNN>")]
    Run(String),
    #[error("invalid channel id '{0}': expected ch<digits>")]
    Channel(String),
    #[error("invalid raw channel value {0}: expected an unsigned integer")]
    RawChannel(String),
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Run identifier of the form `p<NN>-r<NNN>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct RunId {
    period: String,
    run: String,
    run_number: u32,
}

impl RunId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        let (period, run) = raw
            .split_once('-')
            .ok_or_else(|| IdError::Run(raw.to_string()))?;
        let period_ok = period.strip_prefix('p').is_some_and(is_digits);
        let run_number = run
            .strip_prefix('r')
            .filter(|digits| is_digits(digits))
            .and_then(|digits| digits.parse::<u32>().ok());
        match run_number {
            Some(run_number) if period_ok => Ok(Self {
                period: period.to_string(),
                run: run.to_string(),
                run_number,
            }),
            _ => Err(IdError::Run(raw.to_string())),
        }
    }

    /// Period component, e.g. `p07`.
    pub fn period(&self) -> &str {
        &self.period
    }

    /// Run component, e.g. `r007`.
    pub fn run(&self) -> &str {
        &self.run
    }

    /// Numeric run index, e.g. `7` for `r007`.
    pub fn run_number(&self) -> u32 {
        self.run_number
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.period, self.run)
    }
}

impl FromStr for RunId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// Canonical channel key `ch<digits>`, shared by calibration records and
/// channel maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        match raw.strip_prefix("ch") {
            Some(digits) if is_digits(digits) => Ok(Self(raw.to_string())),
            _ => Err(IdError::Channel(raw.to_string())),
        }
    }

    /// Normalizes a bare numeric channel value as delivered by a channel-map
    /// provider. Numeric strings are accepted too.
    pub fn from_raw(raw: &Value) -> Result<Self, IdError> {
        match raw {
            Value::Number(n) => n
                .as_u64()
                .map(|v| Self(format!("ch{}", v)))
                .ok_or_else(|| IdError::RawChannel(raw.to_string())),
            Value::String(s) if is_digits(s) => Ok(Self(format!("ch{}", s))),
            _ => Err(IdError::RawChannel(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ChannelId> for String {
    fn from(value: ChannelId) -> Self {
        value.0
    }
}
