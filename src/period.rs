//! Calendar-quarter reporting periods (`YYYY-Qn`)
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::error::EngineError;

/// A calendar quarter. Displayed and stored as `YYYY-Qn`, which is also the
/// exact key used by the credit ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: i32,
    quarter: u32,
}

impl Period {
    /// Years outside `1000..=9999` are refused so the `YYYY-Qn` key always
    /// parses back.
    pub fn new(year: i32, quarter: u32) -> Result<Self, EngineError> {
        if !(1000..=9999).contains(&year) || !(1..=4).contains(&quarter) {
            return Err(EngineError::InvalidPeriod(format!("{year}-Q{quarter}")));
        }
        Ok(Self { year, quarter })
    }

    /// The quarter `date` falls in: `YYYY-Q{ceil(month/3)}`.
    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            quarter: date.month0() / 3 + 1,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> u32 {
        self.quarter
    }

    /// Calendar months (1-12) covered by the quarter.
    pub fn months(&self) -> std::ops::RangeInclusive<u32> {
        let first = (self.quarter - 1) * 3 + 1;
        first..=first + 2
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && self.months().contains(&date.month())
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-Q{}", self.year, self.quarter)
    }
}

impl FromStr for Period {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::InvalidPeriod(s.to_string());

        let (year, quarter) = s.trim().split_once("-Q").ok_or_else(invalid)?;
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) || quarter.len() != 1 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let quarter: u32 = quarter.parse().map_err(|_| invalid())?;

        Period::new(year, quarter).map_err(|_| invalid())
    }
}

impl TryFrom<String> for Period {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

// stored as its string key so ledger entries stay readable by other consumers
impl<C> minicbor::Encode<C> for Period {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.str(&self.to_string())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Period {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let key = d.str()?;

        key.parse()
            .map_err(|_| minicbor::decode::Error::message("stored period is not YYYY-Qn"))
    }
}
