//! Daily outside-temperature high/low log.
//!
//! One CSV line per completed local day, `M-D-YYYY,high,low`, appended as
//! days finish. The aggregator recovers its position from the last line of
//! the file, so re-running it over the same samples never duplicates a day.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use atticfan_types::{DailyHighLow, DayCalendar, Millis, Sample, format_log_date, parse_log_date};

use crate::error::{Error, Result};

/// Builds [`DailyHighLow`] records from the temperature log.
pub struct HighLowAggregator {
    path: PathBuf,
    calendar: Arc<dyn DayCalendar>,
    last_day_begin: Option<Millis>,
}

impl std::fmt::Debug for HighLowAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HighLowAggregator")
            .field("path", &self.path)
            .field("last_day_begin", &self.last_day_begin)
            .finish()
    }
}

/// Running extremes for the day being scanned.
struct OpenDay {
    start: Millis,
    end: Millis,
    high: f64,
    low: f64,
    /// Samples do not reach back to the start of the day.
    partial: bool,
}

impl HighLowAggregator {
    /// Open the log at `path`, resuming after its last recorded day.
    pub fn open(path: impl Into<PathBuf>, calendar: Arc<dyn DayCalendar>) -> Result<Self> {
        let path = path.into();
        let last_day_begin = read_high_low(&path, calendar.as_ref())?
            .last()
            .map(|d| d.day_start);
        if let Some(t) = last_day_begin {
            debug!("High/low log resumes after day starting {}", t);
        }
        Ok(Self {
            path,
            calendar,
            last_day_begin,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Local midnight of the most recent day already recorded.
    pub fn last_day_begin(&self) -> Option<Millis> {
        self.last_day_begin
    }

    /// Summarize every day that finished since the last recorded one.
    ///
    /// `samples` must be in time order. A day is only recorded once a sample
    /// from a later day has been seen. With nothing recorded yet, the first
    /// day is skipped unless its samples start at midnight, since the log
    /// may have begun partway through it. The new records are appended to
    /// the file and returned; on an append failure nothing advances and the
    /// same days are retried next time.
    pub fn update<'a, I>(&mut self, samples: I) -> Result<Vec<DailyHighLow>>
    where
        I: IntoIterator<Item = &'a Sample>,
    {
        let from = self
            .last_day_begin
            .map(|t| self.calendar.next_day_start(t));

        let mut done = Vec::new();
        let mut open: Option<OpenDay> = None;
        let mut first = true;

        for sample in samples {
            if from.is_some_and(|from| sample.t < from) {
                continue;
            }
            let value = sample.outside_temp;

            match open.as_mut() {
                Some(day) if sample.t < day.end => {
                    day.high = day.high.max(value);
                    day.low = day.low.min(value);
                    continue;
                }
                Some(day) if day.partial => debug!(
                    "Skipping high/low for partial day starting {}",
                    day.start
                ),
                Some(day) => done.push(self.close(day)),
                None => {}
            }

            let start = self.calendar.day_start(sample.t);
            open = Some(OpenDay {
                start,
                end: self.calendar.next_day_start(sample.t),
                high: value,
                low: value,
                partial: first && from.is_none() && sample.t > start,
            });
            first = false;
        }

        if done.is_empty() {
            return Ok(done);
        }

        self.append(&done)?;
        self.last_day_begin = done.last().map(|d| d.day_start);
        info!("Recorded high/low for {} day(s)", done.len());
        Ok(done)
    }

    fn close(&self, day: &OpenDay) -> DailyHighLow {
        DailyHighLow {
            day_start: day.start,
            date: self.calendar.date_of(day.start),
            high: day.high,
            low: day.low,
        }
    }

    fn append(&self, days: &[DailyHighLow]) -> Result<()> {
        let wrap = |source: csv::Error| Error::HighLow {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|source| Error::CreateDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| Error::Write {
                path: self.path.clone(),
                source,
            })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for day in days {
            writer
                .write_record([
                    format_log_date(day.date),
                    day.high.to_string(),
                    day.low.to_string(),
                ])
                .map_err(wrap)?;
        }
        writer.flush().map_err(|source| Error::Write {
            path: self.path.clone(),
            source,
        })
    }
}

/// Read every well-formed record from a high/low log.
///
/// A missing file gives an empty list; unparseable lines are skipped.
pub fn read_high_low(path: &Path, calendar: &dyn DayCalendar) -> Result<Vec<DailyHighLow>> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(Error::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut days: Vec<DailyHighLow> = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("High/low line {}: {}", i + 1, e);
                continue;
            }
        };
        let parsed = (|| {
            let date = parse_log_date(record.get(0)?)?;
            let high = record.get(1)?.parse().ok()?;
            let low = record.get(2)?.parse().ok()?;
            Some(DailyHighLow {
                day_start: calendar.start_of_date(date),
                date,
                high,
                low,
            })
        })();

        match parsed {
            Some(day) if days.last().is_some_and(|prev| day.date <= prev.date) => {
                warn!("High/low line {}: {} is not after the previous day", i + 1, day.date);
            }
            Some(day) => days.push(day),
            None => warn!("High/low line {}: malformed record", i + 1),
        }
    }
    Ok(days)
}
