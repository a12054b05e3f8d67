//! Epidemiological week arithmetic.
//!
//! Epiweeks are encoded as `YYYYWW` integers and follow MMWR numbering:
//! weeks run Sunday through Saturday, and week 1 of a year is the first week
//! with at least four days in that year (the week containing January 4th).
//! A year therefore has either 52 or 53 weeks.

use chrono::{Datelike, Duration, NaiveDate};
use std::fmt;
use thiserror::Error;

const MIN_YEAR: i32 = 1000;
const MAX_YEAR: i32 = 9999;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EpiweekError {
    #[error("Invalid epiweek {0}: {1}")]
    InvalidEpiweek(i32, String),
    #[error("Epiweek arithmetic out of range")]
    OutOfRange,
}

/// A validated epidemiological week
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epiweek {
    year: i32,
    week: u32,
}

/// Returns the Sunday that starts week 1 of `year`
fn year_start(year: i32) -> Option<NaiveDate> {
    let jan4 = NaiveDate::from_ymd_opt(year, 1, 4)?;
    Some(jan4 - Duration::days(i64::from(jan4.weekday().num_days_from_sunday())))
}

/// Returns the number of epiweeks (52 or 53) in `year`
pub fn weeks_in_year(year: i32) -> u32 {
    match (year_start(year), year_start(year + 1)) {
        (Some(start), Some(next)) => ((next - start).num_days() / 7) as u32,
        _ => 52,
    }
}

impl Epiweek {
    pub fn new(year: i32, week: u32) -> Result<Self, EpiweekError> {
        let encoded = year.saturating_mul(100).saturating_add(week as i32);
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(EpiweekError::InvalidEpiweek(
                encoded,
                format!("year must be between {} and {}", MIN_YEAR, MAX_YEAR),
            ));
        }
        let max_week = weeks_in_year(year);
        if week == 0 || week > max_week {
            return Err(EpiweekError::InvalidEpiweek(
                encoded,
                format!("week must be between 1 and {} in {}", max_week, year),
            ));
        }
        Ok(Self { year, week })
    }

    /// Returns the epiweek containing `date`
    pub fn from_date(date: NaiveDate) -> Result<Self, EpiweekError> {
        let mut year = date.year();
        let mut start = year_start(year).ok_or(EpiweekError::OutOfRange)?;
        if date < start {
            year -= 1;
            start = year_start(year).ok_or(EpiweekError::OutOfRange)?;
        } else if let Some(next) = year_start(year + 1) {
            if date >= next {
                year += 1;
                start = next;
            }
        }
        let week = ((date - start).num_days() / 7) as u32 + 1;
        Self::new(year, week)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    /// Returns the `YYYYWW` encoding
    pub fn value(&self) -> i32 {
        self.year * 100 + self.week as i32
    }

    /// Returns the Sunday this week starts on
    pub fn start_date(&self) -> NaiveDate {
        // Both year and week were validated on construction
        year_start(self.year).unwrap_or(NaiveDate::MIN)
            + Duration::weeks(i64::from(self.week) - 1)
    }

    /// Moves forward (or backward, for negative `weeks`) by a number of weeks
    pub fn add_weeks(&self, weeks: i64) -> Result<Self, EpiweekError> {
        let date = self
            .start_date()
            .checked_add_signed(Duration::weeks(weeks))
            .ok_or(EpiweekError::OutOfRange)?;
        Self::from_date(date).map_err(|_| EpiweekError::OutOfRange)
    }

    /// Returns the signed number of weeks from `self` to `other`
    pub fn delta(&self, other: Epiweek) -> i64 {
        (other.start_date() - self.start_date()).num_weeks()
    }

    /// Returns every epiweek from `first` to `last`, inclusive
    pub fn range(first: Epiweek, last: Epiweek) -> EpiweekRange {
        EpiweekRange {
            next: (first <= last).then_some(first),
            last,
        }
    }
}

impl TryFrom<i32> for Epiweek {
    type Error = EpiweekError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        if value < 0 {
            return Err(EpiweekError::InvalidEpiweek(
                value,
                "epiweek cannot be negative".to_string(),
            ));
        }
        Self::new(value / 100, (value % 100) as u32)
    }
}

impl From<Epiweek> for i32 {
    fn from(epiweek: Epiweek) -> Self {
        epiweek.value()
    }
}

impl fmt::Display for Epiweek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:02}", self.year, self.week)
    }
}

/// Inclusive iterator over consecutive epiweeks
#[derive(Debug, Clone)]
pub struct EpiweekRange {
    next: Option<Epiweek>,
    last: Epiweek,
}

impl Iterator for EpiweekRange {
    type Item = Epiweek;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = if current < self.last {
            current.add_weeks(1).ok()
        } else {
            None
        };
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ew(value: i32) -> Epiweek {
        Epiweek::try_from(value).unwrap()
    }

    #[test]
    fn test_weeks_in_year() {
        assert_eq!(weeks_in_year(2014), 53);
        assert_eq!(weeks_in_year(2015), 52);
        assert_eq!(weeks_in_year(2016), 52);
        assert_eq!(weeks_in_year(2020), 53);
    }

    #[test]
    fn test_validation() {
        assert!(Epiweek::try_from(201453).is_ok());
        assert!(matches!(
            Epiweek::try_from(201553),
            Err(EpiweekError::InvalidEpiweek(201553, _))
        ));
        assert!(Epiweek::try_from(201500).is_err());
        assert!(Epiweek::try_from(-201501).is_err());
        assert!(Epiweek::try_from(99901).is_err());
    }

    #[test]
    fn test_encoding() {
        let week = ew(201501);
        assert_eq!(week.year(), 2015);
        assert_eq!(week.week(), 1);
        assert_eq!(week.value(), 201501);
        assert_eq!(week.to_string(), "201501");
        assert_eq!(i32::from(ew(201509)), 201509);
    }

    #[test]
    fn test_from_date() {
        // 2015 week 1 starts on Sunday 2015-01-04
        let date = NaiveDate::from_ymd_opt(2015, 1, 4).unwrap();
        assert_eq!(Epiweek::from_date(date).unwrap(), ew(201501));
        // New Year's Day 2015 still belongs to the last week of 2014
        let date = NaiveDate::from_ymd_opt(2015, 1, 1).unwrap();
        assert_eq!(Epiweek::from_date(date).unwrap(), ew(201453));
        // 2016-01-01 falls in week 52 of 2015
        let date = NaiveDate::from_ymd_opt(2016, 1, 1).unwrap();
        assert_eq!(Epiweek::from_date(date).unwrap(), ew(201552));
        // 2019-12-31 falls in week 1 of 2020
        let date = NaiveDate::from_ymd_opt(2019, 12, 31).unwrap();
        assert_eq!(Epiweek::from_date(date).unwrap(), ew(202001));
    }

    #[test]
    fn test_add_weeks() {
        assert_eq!(ew(201452).add_weeks(1).unwrap(), ew(201453));
        assert_eq!(ew(201453).add_weeks(1).unwrap(), ew(201501));
        assert_eq!(ew(201552).add_weeks(1).unwrap(), ew(201601));
        assert_eq!(ew(201501).add_weeks(-1).unwrap(), ew(201453));
        assert_eq!(ew(201510).add_weeks(0).unwrap(), ew(201510));
        assert_eq!(ew(201501).add_weeks(52).unwrap(), ew(201601));
    }

    #[test]
    fn test_delta() {
        assert_eq!(ew(201450).delta(ew(201502)), 5);
        assert_eq!(ew(201502).delta(ew(201450)), -5);
        assert_eq!(ew(201501).delta(ew(201501)), 0);
    }

    #[test]
    fn test_range() {
        let weeks: Vec<i32> = Epiweek::range(ew(201452), ew(201502))
            .map(|w| w.value())
            .collect();
        assert_eq!(weeks, vec![201452, 201453, 201501, 201502]);

        assert_eq!(Epiweek::range(ew(201510), ew(201510)).count(), 1);
        assert_eq!(Epiweek::range(ew(201510), ew(201501)).count(), 0);
    }
}
