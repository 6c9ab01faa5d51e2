use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Seven selectable guide days: today plus six ahead.
pub const MAX_EPG_DAYS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayDelta {
    Previous,
    Current,
    Next,
}

impl FromStr for DayDelta {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "previous" | "prev" => Ok(DayDelta::Previous),
            "current" | "today" => Ok(DayDelta::Current),
            "next" => Ok(DayDelta::Next),
            other => Err(format!("unknown day delta '{other}'")),
        }
    }
}

/// DVB content genre (level-1 nibble of the content descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Genre {
    #[default]
    All,
    Movie,
    News,
    Show,
    Sports,
    Children,
    Music,
    Arts,
    Social,
    Education,
    Leisure,
    Special,
}

impl Genre {
    /// Content nibble carried in the event's genre code. `All` has none.
    pub fn code(self) -> Option<u8> {
        match self {
            Genre::All => None,
            Genre::Movie => Some(0x1),
            Genre::News => Some(0x2),
            Genre::Show => Some(0x3),
            Genre::Sports => Some(0x4),
            Genre::Children => Some(0x5),
            Genre::Music => Some(0x6),
            Genre::Arts => Some(0x7),
            Genre::Social => Some(0x8),
            Genre::Education => Some(0x9),
            Genre::Leisure => Some(0xA),
            Genre::Special => Some(0xB),
        }
    }

    pub fn from_code(code: u8) -> Option<Genre> {
        match code {
            0x1 => Some(Genre::Movie),
            0x2 => Some(Genre::News),
            0x3 => Some(Genre::Show),
            0x4 => Some(Genre::Sports),
            0x5 => Some(Genre::Children),
            0x6 => Some(Genre::Music),
            0x7 => Some(Genre::Arts),
            0x8 => Some(Genre::Social),
            0x9 => Some(Genre::Education),
            0xA => Some(Genre::Leisure),
            0xB => Some(Genre::Special),
            _ => None,
        }
    }

    pub fn matches(self, code: u8) -> bool {
        match self.code() {
            None => true,
            Some(c) => c == code,
        }
    }
}

impl fmt::Display for Genre {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Genre::All => "All",
            Genre::Movie => "Movie/Drama",
            Genre::News => "News/Current affairs",
            Genre::Show => "Show/Game show",
            Genre::Sports => "Sports",
            Genre::Children => "Children/Youth",
            Genre::Music => "Music/Ballet/Dance",
            Genre::Arts => "Arts/Culture",
            Genre::Social => "Social/Political/Economics",
            Genre::Education => "Education/Science",
            Genre::Leisure => "Leisure/Hobbies",
            Genre::Special => "Special characteristics",
        };
        f.write_str(s)
    }
}

impl FromStr for Genre {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let genre = match s.to_ascii_lowercase().as_str() {
            "all" => Genre::All,
            "movie" => Genre::Movie,
            "news" => Genre::News,
            "show" => Genre::Show,
            "sports" => Genre::Sports,
            "children" => Genre::Children,
            "music" => Genre::Music,
            "arts" => Genre::Arts,
            "social" => Genre::Social,
            "education" => Genre::Education,
            "leisure" => Genre::Leisure,
            "special" => Genre::Special,
            other => return Err(format!("unknown genre '{other}'")),
        };
        Ok(genre)
    }
}

/// Selected guide day and genre. Pure state, no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterState {
    day_offset: u32,
    max_days: u32,
    genre: Genre,
}

impl FilterState {
    pub fn new(max_days: u32) -> Self {
        Self {
            day_offset: 0,
            max_days,
            genre: Genre::All,
        }
    }

    /// Moves the selected day, clamping to `0..=max_days`, and returns the new offset.
    pub fn apply(&mut self, delta: DayDelta) -> u32 {
        self.day_offset = match delta {
            DayDelta::Previous => self.day_offset.saturating_sub(1),
            DayDelta::Current => 0,
            DayDelta::Next => (self.day_offset + 1).min(self.max_days),
        };
        self.day_offset
    }

    pub fn day_offset(&self) -> u32 {
        self.day_offset
    }

    pub fn max_days(&self) -> u32 {
        self.max_days
    }

    pub fn genre(&self) -> Genre {
        self.genre
    }

    pub fn set_genre(&mut self, genre: Genre) {
        self.genre = genre;
    }
}

impl Default for FilterState {
    fn default() -> Self {
        Self::new(MAX_EPG_DAYS)
    }
}
