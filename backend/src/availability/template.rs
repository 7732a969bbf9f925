use std::collections::BTreeSet;

use anyhow::{Context, anyhow, bail};
use chrono::{NaiveDate, NaiveTime, Weekday};

/// One bookable opening in a weekly template.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: NaiveTime,
    pub duration_min: u32,
}

impl Window {
    pub fn new(start: NaiveTime, duration_min: u32) -> Self {
        Self {
            start,
            duration_min,
        }
    }

    pub fn at(hour: u32, minute: u32, duration_min: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0).map(|start| Self::new(start, duration_min))
    }
}

/// Open windows per weekday, Monday first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WeeklyTemplate {
    days: [Vec<Window>; 7],
}

impl WeeklyTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, weekday: Weekday, windows: impl IntoIterator<Item = Window>) -> Self {
        let mut w: Vec<Window> = windows.into_iter().collect();
        w.sort_by_key(|x| x.start);
        self.days[weekday.num_days_from_monday() as usize] = w;
        self
    }

    pub fn windows(&self, weekday: Weekday) -> &[Window] {
        &self.days[weekday.num_days_from_monday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(Vec::is_empty)
    }

    /// Weekdays, hourly 09:00–12:00 and 14:00–17:00.
    pub fn standard() -> Self {
        let hours = [9, 10, 11, 14, 15, 16];
        let day: Vec<Window> = hours
            .iter()
            .filter_map(|h| Window::at(*h, 0, 60))
            .collect();

        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ]
        .into_iter()
        .fold(Self::new(), |t, d| t.with_day(d, day.clone()))
    }

    /// Parses `mon=09:00/60,10:00/60;tue=14:00/45`.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut template = Self::new();

        for day_spec in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (day, windows) = day_spec
                .split_once('=')
                .ok_or_else(|| anyhow!("expected <day>=<windows> in {day_spec:?}"))?;
            let weekday: Weekday = day
                .trim()
                .parse()
                .map_err(|_| anyhow!("unknown weekday {day:?}"))?;

            let mut parsed = Vec::new();
            for w in windows.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let (start, minutes) = w
                    .split_once('/')
                    .ok_or_else(|| anyhow!("expected HH:MM/minutes in {w:?}"))?;
                let start = NaiveTime::parse_from_str(start.trim(), "%H:%M")
                    .with_context(|| format!("bad start time in {w:?}"))?;
                let minutes: u32 = minutes
                    .trim()
                    .parse()
                    .with_context(|| format!("bad duration in {w:?}"))?;
                if minutes == 0 {
                    bail!("zero-length window {w:?}");
                }
                parsed.push(Window::new(start, minutes));
            }
            template = template.with_day(weekday, parsed);
        }

        Ok(template)
    }
}

/// Organization-wide closures (holidays and the like).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockedDates(BTreeSet<NaiveDate>);

impl BlockedDates {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self(dates.into_iter().collect())
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.0.contains(&date)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parses a comma-separated list of ISO dates.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut out = BTreeSet::new();
        for d in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            out.insert(
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .with_context(|| format!("bad blocked date {d:?}"))?,
            );
        }
        Ok(Self(out))
    }
}

/// Inclusive range of local dates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(date: NaiveDate) -> Self {
        Self::new(date, date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(move |d| *d <= self.end)
    }
}
