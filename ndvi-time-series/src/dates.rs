use anyhow::{bail, Context, Result};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};

const MILLIS_PER_DAY: f64 = 86_400_000.0;

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date '{}', expected YYYY-MM-DD", s))
}

/// `steps` instants evenly spaced from `start` to `end`, both included.
pub fn date_linspace(
    start: NaiveDateTime,
    end: NaiveDateTime,
    steps: usize,
) -> Result<Vec<NaiveDateTime>> {
    if steps < 2 {
        bail!("need at least two time steps to span {} .. {}, got {}", start, end, steps);
    }
    let span = (end - start).num_milliseconds();
    let gaps = (steps - 1) as i64;
    if span < gaps {
        bail!("{} .. {} is too short for {} strictly increasing steps", start, end, steps);
    }
    Ok((0..steps as i64)
        .map(|i| {
            let offset = (span as i128 * i as i128 / gaps as i128) as i64;
            start + Duration::milliseconds(offset)
        })
        .collect())
}

/// How time steps map onto the shared x axis of every panel.
#[derive(Debug, Clone)]
pub enum TimeAxis {
    /// x is days since the first date
    Calendar {
        origin: NaiveDateTime,
        dates: Vec<NaiveDateTime>,
    },
    /// x is the raw time step index
    Index { len: usize },
}

impl TimeAxis {
    pub fn calendar(start: NaiveDate, end: NaiveDate, steps: usize) -> Result<Self> {
        let origin = start.and_time(NaiveTime::MIN);
        let dates = date_linspace(origin, end.and_time(NaiveTime::MIN), steps)?;
        Ok(TimeAxis::Calendar { origin, dates })
    }

    pub fn len(&self) -> usize {
        match self {
            TimeAxis::Calendar { dates, .. } => dates.len(),
            TimeAxis::Index { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self, t: usize) -> f64 {
        match self {
            TimeAxis::Calendar { origin, dates } => {
                (dates[t] - *origin).num_milliseconds() as f64 / MILLIS_PER_DAY
            }
            TimeAxis::Index { .. } => t as f64,
        }
    }

    /// Tick label for an x coordinate: abbreviated month, or the step number.
    pub fn label(&self, x: f64) -> String {
        match self {
            TimeAxis::Calendar { origin, .. } => {
                let at = *origin + Duration::milliseconds((x * MILLIS_PER_DAY).round() as i64);
                at.format("%b").to_string()
            }
            TimeAxis::Index { .. } => format!("{}", x.round() as i64),
        }
    }

    /// Tick positions within `[lo, hi]`: month starts on a calendar axis.
    pub fn ticks(&self, lo: f64, hi: f64) -> Vec<f64> {
        match self {
            TimeAxis::Calendar { origin, .. } => {
                let mut ticks = Vec::new();
                let mut month = NaiveDate::from_ymd_opt(origin.year(), origin.month(), 1);
                while let Some(first) = month {
                    let x = (first.and_time(NaiveTime::MIN) - *origin).num_milliseconds() as f64
                        / MILLIS_PER_DAY;
                    if x > hi {
                        break;
                    }
                    if x >= lo {
                        ticks.push(x);
                    }
                    month = first.checked_add_months(chrono::Months::new(1));
                }
                ticks
            }
            TimeAxis::Index { .. } => {
                let step = ((hi - lo) / 10.0).ceil().max(1.0);
                let mut ticks = Vec::new();
                let mut x = lo.ceil();
                while x <= hi {
                    ticks.push(x);
                    x += step;
                }
                ticks
            }
        }
    }
}
