use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;

use crate::filter::Genre;
use crate::middleware::EpgEvent;

pub const HOURS: usize = 24;

/// Display text for a DVB content nibble. Unknown codes map to "".
pub fn genre_text(code: u8) -> String {
    Genre::from_code(code)
        .map(|g| g.to_string())
        .unwrap_or_default()
}

/// Minimum viewer age for a DVB parental rating code (rating + 3).
pub fn parental_rating_text(rating: u8) -> String {
    match rating {
        0x01..=0x0F => format!("{}+", rating + 3),
        _ => String::new(),
    }
}

/// An EPG event clipped to a single hour slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketedEvent {
    pub channel: usize,
    pub name: String,
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
    pub description: String,
    pub parental_rating: String,
    pub genre: String,
    /// The middleware event this entry was cut from.
    pub source: EpgEvent,
}

impl BucketedEvent {
    fn clipped(channel: usize, event: &EpgEvent, begin: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            channel,
            name: event.name.clone(),
            begin,
            end,
            description: event.description.clone(),
            parental_rating: parental_rating_text(event.parental_rating),
            genre: genre_text(event.genre),
            source: event.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSlot {
    pub hour: u32,
    /// Indexed by logical channel.
    pub channels: Vec<Vec<BucketedEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeSlotGrid {
    pub date: Option<NaiveDate>,
    pub day_offset: u32,
    pub slots: Vec<TimeSlot>,
}

impl Default for TimeSlotGrid {
    fn default() -> Self {
        Self::new(0)
    }
}

impl TimeSlotGrid {
    pub fn new(channel_count: usize) -> Self {
        let slots = (0..HOURS as u32)
            .map(|hour| TimeSlot {
                hour,
                channels: vec![Vec::new(); channel_count],
            })
            .collect();
        Self {
            date: None,
            day_offset: 0,
            slots,
        }
    }

    pub fn for_day(channel_count: usize, date: NaiveDate, day_offset: u32) -> Self {
        let mut grid = Self::new(channel_count);
        grid.date = Some(date);
        grid.day_offset = day_offset;
        grid
    }

    pub fn channel_count(&self) -> usize {
        self.slots.first().map_or(0, |s| s.channels.len())
    }

    pub fn events(&self, hour: usize, channel: usize) -> &[BucketedEvent] {
        self.slots
            .get(hour)
            .and_then(|s| s.channels.get(channel))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entry(&self, hour: usize, channel: usize, index: usize) -> Option<&BucketedEvent> {
        self.events(hour, channel).get(index)
    }

    pub fn event_count(&self) -> usize {
        self.slots
            .iter()
            .flat_map(|s| s.channels.iter())
            .map(Vec::len)
            .sum()
    }

    fn push(&mut self, hour: u32, entry: BucketedEvent) -> bool {
        match self
            .slots
            .get_mut(hour as usize)
            .and_then(|s| s.channels.get_mut(entry.channel))
        {
            Some(list) => {
                list.push(entry);
                true
            }
            None => false,
        }
    }
}

fn at(day: NaiveDate, hour: u32, minute: u32) -> NaiveDateTime {
    day.and_time(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN))
}

/// Places events into hour slots for one aggregation pass.
///
/// The reference day is taken from the first event placed and then stays
/// fixed for every channel of the pass. Events starting on another day are
/// dropped; events ending on another day are cut at 23:59 of the reference
/// day. An event crossing an hour boundary becomes two entries, one under
/// its begin hour and one under its end hour. Hours in between stay empty
/// for events longer than two slots.
#[derive(Debug, Default)]
pub struct DayBucketer {
    reference_day: Option<NaiveDate>,
}

impl DayBucketer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reference_day(&self) -> Option<NaiveDate> {
        self.reference_day
    }

    /// Returns how many entries were stored.
    pub fn place(&mut self, grid: &mut TimeSlotGrid, channel: usize, event: &EpgEvent) -> usize {
        let begin = event.start;
        let day = *self.reference_day.get_or_insert(begin.date());
        if begin.date() != day {
            return 0;
        }

        let end = if event.end.date() != day {
            at(day, 23, 59)
        } else {
            event.end
        };

        if begin.hour() < end.hour() {
            let head = BucketedEvent::clipped(channel, event, begin, at(day, begin.hour(), 59));
            let tail = BucketedEvent::clipped(channel, event, at(day, end.hour(), 0), end);
            usize::from(grid.push(begin.hour(), head)) + usize::from(grid.push(end.hour(), tail))
        } else {
            let entry = BucketedEvent::clipped(channel, event, begin, end);
            usize::from(grid.push(begin.hour(), entry))
        }
    }
}
