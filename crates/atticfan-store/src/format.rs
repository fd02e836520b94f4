//! Line-oriented data file codec.
//!
//! The file is UTF-8 text with CRLF line endings. Each section starts with a
//! header line `[name] {json metadata}` followed by comma-separated rows:
//!
//! ```text
//! [temperatures] {"formatVersion":"1","fields":["t","atticTemp","outsideTemp"]}
//! 1467331200000,35.12,24.5
//! [fanOnOff] {"formatVersion":"1","fields":["t","event","reason"]}
//! 1467331260000,on,temp delta exceeded
//! ```
//!
//! Writes go to a temporary file that is renamed over the target only once
//! it is complete and synced, so a crash leaves either the old file or the
//! new one. Every write gets its own temporary file, and a [`WriteGate`]
//! lets only the newest write started rename into place, so a writer that
//! stalls and resumes late cannot replace newer data. Reads are tolerant:
//! garbled rows and unknown sections are skipped with a warning.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use atticfan_types::{FanEvent, FanState, Sample};

use crate::error::{Error, Result};

/// Section holding [`Sample`] rows.
pub const TEMPERATURES_SECTION: &str = "temperatures";
/// Section holding [`FanEvent`] rows.
pub const FAN_SECTION: &str = "fanOnOff";
/// Only format version written and understood.
pub const FORMAT_VERSION: &str = "1";

const CRLF: &str = "\r\n";

/// Metadata carried in a section header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionMeta {
    pub format_version: String,
    pub fields: Vec<String>,
}

impl SectionMeta {
    fn new(fields: &[&str]) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

const TEMP_SUFFIX: &str = ".new";

/// Path of the temporary file used by write `generation` of `path`.
pub fn temp_path(path: &Path, generation: u64) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}{}", generation, TEMP_SUFFIX));
    PathBuf::from(name)
}

fn is_temp_name(file_name: &str, target: &str) -> bool {
    file_name
        .strip_prefix(target)
        .and_then(|rest| rest.strip_prefix('.'))
        .and_then(|rest| rest.strip_suffix(TEMP_SUFFIX))
        .is_some_and(|generation| {
            !generation.is_empty() && generation.bytes().all(|b| b.is_ascii_digit())
        })
}

/// Remove temporary files left behind by interrupted writes of `path`.
///
/// Returns how many were removed.
pub fn remove_leftover_temps(path: &Path) -> usize {
    let Some(target) = path.file_name().and_then(|n| n.to_str()) else {
        return 0;
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_str().is_some_and(|n| is_temp_name(n, target)) {
            continue;
        }
        let temp = entry.path();
        match fs::remove_file(&temp) {
            Ok(()) => {
                warn!("Removed leftover temporary file {}", temp.display());
                removed += 1;
            }
            Err(e) => warn!("Could not remove leftover {}: {}", temp.display(), e),
        }
    }
    removed
}

/// Hands out write generations for one file.
///
/// Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct WriteGate {
    newest: Arc<Mutex<u64>>,
}

impl WriteGate {
    /// Start a new write. Every ticket handed out earlier becomes stale.
    pub fn begin(&self) -> WriteTicket {
        let mut newest = lock(&self.newest);
        *newest += 1;
        WriteTicket {
            newest: Arc::clone(&self.newest),
            generation: *newest,
        }
    }
}

/// Permission for one write to rename into place, while still current.
#[derive(Debug)]
pub struct WriteTicket {
    newest: Arc<Mutex<u64>>,
    generation: u64,
}

impl WriteTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn lock(newest: &Mutex<u64>) -> MutexGuard<'_, u64> {
    newest.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==========================================================================
// Writing
// ==========================================================================

fn write_header<W: Write>(out: &mut W, name: &str, fields: &[&str]) -> io::Result<()> {
    let meta = serde_json::to_string(&SectionMeta::new(fields)).map_err(io::Error::other)?;
    write!(out, "[{}] {}{}", name, meta, CRLF)
}

/// Reasons are free text; line breaks would split the row.
fn clean_reason(reason: &str) -> String {
    reason.replace(['\r', '\n'], " ")
}

/// Encode both logs into `out`.
pub fn encode<'a, W, T, E>(out: &mut W, temperatures: T, events: E) -> io::Result<()>
where
    W: Write,
    T: IntoIterator<Item = &'a Sample>,
    E: IntoIterator<Item = &'a FanEvent>,
{
    write_header(out, TEMPERATURES_SECTION, &["t", "atticTemp", "outsideTemp"])?;
    for s in temperatures {
        write!(out, "{},{},{}{}", s.t, s.attic_temp, s.outside_temp, CRLF)?;
    }

    write_header(out, FAN_SECTION, &["t", "event", "reason"])?;
    for e in events {
        write!(out, "{},{},{}{}", e.t, e.event, clean_reason(&e.reason), CRLF)?;
    }
    Ok(())
}

/// Replace `path` with whatever `body` writes, atomically.
///
/// If `body` or any later step fails, the temporary file is removed and the
/// previous contents of `path` are untouched. If a newer write started
/// while this one ran, the result is discarded with [`Error::Superseded`].
pub fn write_atomic<F>(path: &Path, ticket: &WriteTicket, body: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        fs::create_dir_all(dir).map_err(|source| Error::CreateDirectory {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let temp = temp_path(path, ticket.generation);
    let result = (|| -> io::Result<bool> {
        let mut writer = BufWriter::new(File::create(&temp)?);
        body(&mut writer)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        // held across the rename so a newer write cannot start in between
        let newest = lock(&ticket.newest);
        if *newest != ticket.generation {
            return Ok(false);
        }
        // rename replaces the target in one step, no unlink needed
        fs::rename(&temp, path)?;
        Ok(true)
    })();

    let outcome = match result {
        Ok(true) => {
            debug!("Wrote {}", path.display());
            return Ok(());
        }
        Ok(false) => {
            warn!(
                "Discarding write {} of {}, a newer one has started",
                ticket.generation,
                path.display()
            );
            Error::Superseded {
                path: path.to_path_buf(),
            }
        }
        Err(source) => Error::Write {
            path: path.to_path_buf(),
            source,
        },
    };

    if let Err(e) = fs::remove_file(&temp)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!("Could not remove partial {}: {}", temp.display(), e);
    }
    Err(outcome)
}

/// Atomically write both logs to `path`.
pub fn write_log(
    path: &Path,
    ticket: &WriteTicket,
    temperatures: &VecDeque<Sample>,
    events: &VecDeque<FanEvent>,
) -> Result<()> {
    write_atomic(path, ticket, |w| encode(w, temperatures, events))
}

// ==========================================================================
// Reading
// ==========================================================================

/// What a tolerant read had to skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Rows that could not be parsed or were out of order.
    pub skipped_rows: usize,
    /// Names of sections that were not understood.
    pub skipped_sections: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.skipped_rows == 0 && self.skipped_sections.is_empty()
    }
}

/// Logs recovered from a data file.
#[derive(Debug, Clone, Default)]
pub struct DecodedLog {
    pub temperatures: VecDeque<Sample>,
    pub fan_events: VecDeque<FanEvent>,
    pub report: LoadReport,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Temperatures,
    FanEvents,
    /// Rows are ignored until the next header.
    Skipped,
}

fn parse_header(line: &str) -> Option<(&str, &str)> {
    let rest = line.strip_prefix('[')?;
    let end = rest.find(']')?;
    Some((&rest[..end], rest[end + 1..].trim()))
}

fn section_for(name: &str, meta: &str, report: &mut LoadReport) -> Section {
    let section = match name {
        TEMPERATURES_SECTION => Section::Temperatures,
        FAN_SECTION => Section::FanEvents,
        _ => {
            warn!("Skipping unknown section [{}]", name);
            report.skipped_sections.push(name.to_string());
            return Section::Skipped;
        }
    };

    match serde_json::from_str::<SectionMeta>(meta) {
        Ok(m) if m.format_version == FORMAT_VERSION => section,
        Ok(m) => {
            warn!(
                "Skipping section [{}] with unsupported format version {}",
                name, m.format_version
            );
            report.skipped_sections.push(name.to_string());
            Section::Skipped
        }
        Err(e) => {
            // metadata is advisory, the section name decides the layout
            warn!("Unreadable metadata for section [{}]: {}", name, e);
            section
        }
    }
}

fn parse_sample(row: &str) -> Option<Sample> {
    let mut parts = row.split(',');
    let t = parts.next()?.trim().parse().ok()?;
    let attic: f64 = parts.next()?.trim().parse().ok()?;
    let outside: f64 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() || !attic.is_finite() || !outside.is_finite() {
        return None;
    }
    Some(Sample::new(t, attic, outside))
}

fn parse_event(row: &str) -> Option<FanEvent> {
    let mut parts = row.splitn(3, ',');
    let t = parts.next()?.trim().parse().ok()?;
    let event: FanState = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").trim();
    Some(FanEvent::new(t, event, reason))
}

/// Decode a data file from `input`.
///
/// Never fails on content; only I/O errors from `input` are returned.
pub fn decode<R: BufRead>(mut input: R) -> io::Result<DecodedLog> {
    let mut log = DecodedLog::default();
    let mut section: Option<Section> = None;
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;

        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            continue;
        }

        if let Some((name, meta)) = parse_header(line) {
            section = Some(section_for(name, meta, &mut log.report));
            continue;
        }

        match section {
            None => {
                warn!("Line {}: data before any section header", line_no);
                log.report.skipped_rows += 1;
            }
            Some(Section::Skipped) => {}
            Some(Section::Temperatures) => match parse_sample(line) {
                Some(s) if log.temperatures.back().is_some_and(|prev| s.t < prev.t) => {
                    warn!("Line {}: temperature row out of order", line_no);
                    log.report.skipped_rows += 1;
                }
                Some(s) => log.temperatures.push_back(s),
                None => {
                    warn!("Line {}: malformed temperature row {:?}", line_no, line);
                    log.report.skipped_rows += 1;
                }
            },
            Some(Section::FanEvents) => match parse_event(line) {
                Some(e) if log.fan_events.back().is_some_and(|prev| e.t < prev.t) => {
                    warn!("Line {}: fan event row out of order", line_no);
                    log.report.skipped_rows += 1;
                }
                Some(e) => log.fan_events.push_back(e),
                None => {
                    warn!("Line {}: malformed fan event row {:?}", line_no, line);
                    log.report.skipped_rows += 1;
                }
            },
        }
    }

    Ok(log)
}

/// Read a data file. A missing file yields empty logs.
pub fn read_log(path: &Path) -> Result<DecodedLog> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No data file at {}, starting empty", path.display());
            return Ok(DecodedLog::default());
        }
        Err(source) => {
            return Err(Error::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    decode(BufReader::new(file)).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })
}
