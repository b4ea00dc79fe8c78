/**
 * HORLOGE - Temps mur local injectable
 *
 * RÔLE : fournir "maintenant" aux moteurs d'agrégation et au limiteur de
 * notifications, et les troncatures minute/heure/jour/mois/année.
 *
 * FONCTIONNEMENT :
 * - SystemClock = heure système décalée d'un offset fixe (résolu au démarrage)
 * - ManualClock = horloge pilotée par les tests (set / advance)
 * - BoundaryTracker = détection de franchissement minute→année par comparaison
 *   des instants tronqués (jamais de rattrapage des frontières manquées)
 */

use parking_lot::Mutex;
use std::sync::Arc;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

/// Format des horodatages persistés et diffusés (`2025-03-14 09:26:00`)
pub const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Format des dates de requête (`2025-03-14`)
pub const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

time::serde::format_description!(pub timestamp_serde, PrimitiveDateTime, "[year]-[month]-[day] [hour]:[minute]:[second]");
time::serde::format_description!(pub date_serde, Date, "[year]-[month]-[day]");

pub trait Clock: Send + Sync {
    fn now(&self) -> PrimitiveDateTime;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    /// Offset explicite en heures, sinon offset local, sinon UTC.
    pub fn from_config(utc_offset_hours: Option<i8>) -> Self {
        let offset = match utc_offset_hours {
            Some(hours) => UtcOffset::from_hms(hours, 0, 0).unwrap_or_else(|e| {
                tracing::warn!(hours, error = %e, "invalid utc offset, falling back to UTC");
                UtcOffset::UTC
            }),
            None => UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC),
        };
        Self { offset }
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }
}

impl Clock for SystemClock {
    fn now(&self) -> PrimitiveDateTime {
        let now = OffsetDateTime::now_utc().to_offset(self.offset);
        PrimitiveDateTime::new(now.date(), now.time())
    }
}

#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<PrimitiveDateTime>>,
}

impl ManualClock {
    pub fn new(start: PrimitiveDateTime) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn set(&self, at: PrimitiveDateTime) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> PrimitiveDateTime {
        *self.now.lock()
    }
}

pub fn format_timestamp(ts: PrimitiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).unwrap_or_else(|_| ts.to_string())
}

pub fn parse_timestamp(text: &str) -> Result<PrimitiveDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
}

pub fn parse_date(text: &str) -> Result<Date, time::error::Parse> {
    Date::parse(text, DATE_FORMAT)
}

// troncatures
pub fn minute_start(ts: PrimitiveDateTime) -> PrimitiveDateTime {
    let t = ts.time();
    PrimitiveDateTime::new(
        ts.date(),
        Time::MIDNIGHT + Duration::hours(t.hour() as i64) + Duration::minutes(t.minute() as i64),
    )
}

pub fn hour_start(ts: PrimitiveDateTime) -> PrimitiveDateTime {
    PrimitiveDateTime::new(ts.date(), Time::MIDNIGHT + Duration::hours(ts.hour() as i64))
}

pub fn day_start(date: Date) -> PrimitiveDateTime {
    PrimitiveDateTime::new(date, Time::MIDNIGHT)
}

pub fn month_start(date: Date) -> Date {
    date - Duration::days(date.day() as i64 - 1)
}

pub fn next_month_start(date: Date) -> Date {
    month_start(month_start(date) + Duration::days(32))
}

pub fn year_start(date: Date) -> Date {
    date - Duration::days(date.ordinal() as i64 - 1)
}

pub fn next_year_start(date: Date) -> Date {
    // 366 jours depuis le 1er janvier tombent toujours l'année suivante
    year_start(year_start(date) + Duration::days(366))
}

/// Frontières franchies entre deux événements, chacune impliquant la précédente.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crossed {
    pub minute: bool,
    pub hour: bool,
    pub day: bool,
    pub month: bool,
    pub year: bool,
}

/// Suit le dernier instant observé et détecte les changements de période.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryTracker {
    last: PrimitiveDateTime,
}

impl BoundaryTracker {
    pub fn new(start: PrimitiveDateTime) -> Self {
        Self { last: start }
    }

    pub fn last(&self) -> PrimitiveDateTime {
        self.last
    }

    /// Compare `now` au dernier instant observé puis le mémorise.
    /// Cascade stricte : une heure n'est testée que si la minute a changé, etc.
    pub fn observe(&mut self, now: PrimitiveDateTime) -> Crossed {
        let prev = self.last;
        let mut crossed = Crossed::default();
        if minute_start(prev) != minute_start(now) {
            crossed.minute = true;
            self.last = now;
            if hour_start(prev) != hour_start(now) {
                crossed.hour = true;
                if prev.date() != now.date() {
                    crossed.day = true;
                    if month_start(prev.date()) != month_start(now.date()) {
                        crossed.month = true;
                        crossed.year = prev.year() != now.year();
                    }
                }
            }
        }
        crossed
    }
}
