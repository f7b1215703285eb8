//! Money and date primitives.

use chrono::{Local, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Largest hours value a single time entry may carry.
pub const MAX_ENTRY_HOURS: Decimal = dec!(100000);

/// Largest hourly rate accepted on a time entry or attorney.
pub const MAX_HOURLY_RATE: Decimal = dec!(1000000);

/// Largest invoice or payment amount the stores can hold.
pub const MAX_AMOUNT: Decimal = dec!(999999999999.99);

/// Source of "today" for due-date and overdue decisions.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Always reports the same date.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Round half away from zero to cents.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `hours * rate`, rounded to cents. An entry without a rate bills nothing.
/// `None` when the product does not fit in a `Decimal`.
pub fn line_amount(hours: Decimal, rate: Option<Decimal>) -> Option<Decimal> {
    match rate {
        Some(rate) => hours.checked_mul(rate).map(round_money),
        None => Some(Decimal::ZERO),
    }
}

/// Sum without overflow panics.
pub fn checked_sum(values: impl IntoIterator<Item = Decimal>) -> Option<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value))
}

/// Decimal hours as `h:mm`, e.g. 1.5 becomes `1:30`.
pub fn format_hours(hours: Decimal) -> String {
    let Some(minutes) = hours.checked_mul(Decimal::from(60)) else {
        return hours.to_string();
    };
    let total_minutes = minutes
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .abs();
    let total_minutes = u64::try_from(total_minutes).unwrap_or(0);
    let sign = if hours.is_sign_negative() && total_minutes > 0 {
        "-"
    } else {
        ""
    };
    format!("{}{}:{:02}", sign, total_minutes / 60, total_minutes % 60)
}

/// Amount with currency symbol, thousands separators, and two decimals.
pub fn format_money(amount: Decimal, symbol: &str) -> String {
    let rounded = round_money(amount);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let fixed = format!("{:.2}", rounded.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!(
        "{}{}{}.{}",
        if negative { "-" } else { "" },
        symbol,
        grouped,
        cents
    )
}

/// Add whole days to a date, saturating at the calendar bounds.
pub fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    date.checked_add_signed(chrono::Duration::days(days))
        .unwrap_or(if days < 0 { NaiveDate::MIN } else { NaiveDate::MAX })
}
