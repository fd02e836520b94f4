//! Compact projections of the history for charting.
//!
//! Charts want many points and few bytes, so samples are flattened into
//! positional arrays instead of objects:
//!
//! - temperatures: `[[t, atticTemp, outsideTemp], ...]`
//! - fan events: `[[t, 1|0], ...]`

use serde::Serialize;

use atticfan_types::{DailyHighLow, FanEvent, Millis, Sample, format_log_date};

use crate::error::Result;
use crate::store::TimeSeriesStore;

/// One `[t, atticTemp, outsideTemp]` chart point.
pub type TemperaturePoint = (Millis, f64, f64);

/// One `[t, 1|0]` chart point.
pub type FanPoint = (Millis, u8);

/// Which part of the history a chart covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChartQuery {
    /// Only points with `t >= since`.
    pub since: Option<Millis>,
    /// Keep at most this many of the newest points.
    pub limit: Option<usize>,
}

impl ChartQuery {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn since(mut self, t: Millis) -> Self {
        self.since = Some(t);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

fn tail<T>(mut points: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit
        && points.len() > limit
    {
        points.drain(..points.len() - limit);
    }
    points
}

fn temperature_point(s: &Sample) -> TemperaturePoint {
    (s.t, s.attic_temp, s.outside_temp)
}

fn fan_point(e: &FanEvent) -> FanPoint {
    (e.t, e.event.level())
}

impl TimeSeriesStore {
    /// Temperature chart points matching `query`.
    pub fn temperature_points(&self, query: &ChartQuery) -> Vec<TemperaturePoint> {
        let points = self
            .temperatures_since(query.since.unwrap_or(Millis::MIN))
            .map(temperature_point)
            .collect();
        tail(points, query.limit)
    }

    /// Fan chart points matching `query`.
    pub fn fan_points(&self, query: &ChartQuery) -> Vec<FanPoint> {
        let points = self
            .fan_events_since(query.since.unwrap_or(Millis::MIN))
            .map(fan_point)
            .collect();
        tail(points, query.limit)
    }

    /// Temperature chart as compact JSON.
    pub fn temperature_chart_json(&self, query: &ChartQuery) -> Result<String> {
        Ok(serde_json::to_string(&self.temperature_points(query))?)
    }

    /// Fan chart as compact JSON.
    pub fn fan_chart_json(&self, query: &ChartQuery) -> Result<String> {
        Ok(serde_json::to_string(&self.fan_points(query))?)
    }
}

/// One day of the high/low log, shaped for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HighLowRow {
    /// `M-D-YYYY`
    pub date: String,
    pub high: f64,
    pub low: f64,
}

impl From<&DailyHighLow> for HighLowRow {
    fn from(d: &DailyHighLow) -> Self {
        Self {
            date: format_log_date(d.date),
            high: d.high,
            low: d.low,
        }
    }
}

/// High/low records as a compact JSON array, newest last.
pub fn high_low_json(days: &[DailyHighLow]) -> Result<String> {
    let rows: Vec<HighLowRow> = days.iter().map(HighLowRow::from).collect();
    Ok(serde_json::to_string(&rows)?)
}
