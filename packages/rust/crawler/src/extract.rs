//! Selector-driven parsing of the source's pages.
//!
//! Everything here is synchronous and works on an already-parsed [`Html`]
//! document, so it can be tested without a network.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use inboxmirror_shared::{
    Direction, DisplayMetadata, MessageChannel, MirrorError, RawMessage, RawSnapshot, Result,
    SelectorConfig,
};

use crate::source::LoginState;

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(오전|오후|AM|PM|am|pm)?\s*(\d{1,2}):(\d{2})").expect("valid clock regex")
});

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{4})\s*(?:년|[.\-/])\s*(\d{1,2})\s*(?:월|[.\-/])\s*(\d{1,2})")
        .expect("valid date regex")
});

static RELATIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+)\s*(분|시간|일|minutes?|hours?|days?)\s*(?:전|ago)")
        .expect("valid relative time regex")
});

static DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("valid digits regex"));

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

/// [`SelectorConfig`] compiled once at startup.
#[derive(Debug)]
pub struct CompiledSelectors {
    title: Selector,
    counterpart: Selector,
    category: Selector,
    location: Selector,
    price: Selector,
    unread_badge: Selector,
    message_item: Selector,
    message_content: Selector,
    message_time: Selector,
    outbound: Selector,
    system: Selector,
    date_divider: Selector,
    inbox_item: Selector,
    inbox_name: Selector,
    inbox_service: Selector,
    inbox_last_message: Selector,
    inbox_time: Selector,
    inbox_unread: Selector,
    inbox_price: Selector,
    logout_link: Selector,
    account_nav: Selector,
    password_input: Selector,
    logout_text: String,
    restricted_paths: Vec<String>,
}

impl CompiledSelectors {
    pub fn compile(config: &SelectorConfig) -> Result<Self> {
        Ok(Self {
            title: compile(&config.title)?,
            counterpart: compile(&config.counterpart)?,
            category: compile(&config.category)?,
            location: compile(&config.location)?,
            price: compile(&config.price)?,
            unread_badge: compile(&config.unread_badge)?,
            message_item: compile(&config.message_item)?,
            message_content: compile(&config.message_content)?,
            message_time: compile(&config.message_time)?,
            outbound: compile(&config.outbound)?,
            system: compile(&config.system)?,
            date_divider: compile(&config.date_divider)?,
            inbox_item: compile(&config.inbox_item)?,
            inbox_name: compile(&config.inbox_name)?,
            inbox_service: compile(&config.inbox_service)?,
            inbox_last_message: compile(&config.inbox_last_message)?,
            inbox_time: compile(&config.inbox_time)?,
            inbox_unread: compile(&config.inbox_unread)?,
            inbox_price: compile(&config.inbox_price)?,
            logout_link: compile(&config.logout_link)?,
            account_nav: compile(&config.account_nav)?,
            password_input: compile(&config.password_input)?,
            logout_text: config.logout_text.clone(),
            restricted_paths: config.restricted_paths.clone(),
        })
    }
}

fn compile(raw: &str) -> Result<Selector> {
    Selector::parse(raw).map_err(|e| MirrorError::config(format!("invalid selector '{raw}': {e}")))
}

// ---------------------------------------------------------------------------
// Login classification
// ---------------------------------------------------------------------------

/// Decide whether a probed page belongs to an authenticated session.
///
/// Landing on the login surface is a hard veto. Otherwise any single strong
/// signal (logout affordance, account-only navigation, still being on a
/// restricted path) is enough to call it logged in.
pub fn classify_login(
    final_url: &Url,
    doc: &Html,
    login_path: &str,
    selectors: &CompiledSelectors,
) -> LoginState {
    let path = final_url.path();
    if path.starts_with(login_path) || path.to_ascii_lowercase().contains("login") {
        return LoginState::LoggedOut;
    }

    let has_logout_link = doc.select(&selectors.logout_link).next().is_some();
    let has_account_nav = doc.select(&selectors.account_nav).next().is_some();
    let has_logout_text = !selectors.logout_text.is_empty()
        && doc
            .root_element()
            .text()
            .any(|t| t.contains(selectors.logout_text.as_str()));
    let on_restricted_path = selectors
        .restricted_paths
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()));

    if has_logout_link || has_account_nav || has_logout_text || on_restricted_path {
        return LoginState::LoggedIn;
    }
    if doc.select(&selectors.password_input).next().is_some() {
        return LoginState::LoggedOut;
    }
    LoginState::Ambiguous
}

// ---------------------------------------------------------------------------
// Conversation header
// ---------------------------------------------------------------------------

/// Pull the source's conversation id out of a chat URL.
pub fn external_key_from_url(pattern: &Regex, url: &Url) -> Option<String> {
    pattern
        .captures(url.as_str())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Read the conversation header. `last_message` is left for the caller to
/// fill from the message list.
pub fn parse_snapshot(doc: &Html, selectors: &CompiledSelectors, external_key: String) -> RawSnapshot {
    let metadata = DisplayMetadata {
        title: first_text(doc, &selectors.title),
        counterpart: first_text(doc, &selectors.counterpart),
        category: first_text(doc, &selectors.category),
        location: first_text(doc, &selectors.location),
        price: first_text(doc, &selectors.price),
    };
    let unread_count = first_text(doc, &selectors.unread_badge)
        .and_then(|text| DIGITS_RE.find(&text).and_then(|m| m.as_str().parse().ok()));

    RawSnapshot {
        external_key,
        metadata,
        unread_count,
        last_message: None,
        last_message_at: None,
    }
}

fn first_text(doc: &Html, selector: &Selector) -> Option<String> {
    doc.select(selector)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|text| !text.is_empty())
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Reference point for relative timestamps such as `14:05`.
#[derive(Debug, Clone, Copy)]
pub struct MessageClock {
    pub today: NaiveDate,
    pub offset: FixedOffset,
}

impl MessageClock {
    pub fn now_local() -> Self {
        let now = chrono::Local::now();
        Self {
            today: now.date_naive(),
            offset: *now.offset(),
        }
    }

    fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        match self.offset.from_local_datetime(&date.and_time(time)).single() {
            Some(local) => local.with_timezone(&Utc),
            None => date.and_time(time).and_utc(),
        }
    }
}

/// Read every message bubble in display order.
///
/// Date dividers between bubbles set the day that bare clock times such as
/// `오후 2:05` belong to; before the first divider that day is today. A
/// bubble whose time cannot be read inherits the previous bubble's
/// timestamp, and the first falls back to the start of the current day.
pub fn parse_messages(doc: &Html, selectors: &CompiledSelectors, clock: &MessageClock) -> Vec<RawMessage> {
    let mut messages = Vec::new();
    let mut day = clock.today;
    let mut previous_at: Option<DateTime<Utc>> = None;

    for el in doc.root_element().descendants().filter_map(ElementRef::wrap) {
        let is_item = selectors.message_item.matches(&el);
        // Wrappers like `[class*="message-wrap"]` can nest a matching bubble.
        if within(el, &selectors.message_item) {
            continue;
        }

        if !is_item {
            if selectors.date_divider.matches(&el) {
                if let Some(date) = parse_divider_date(&el.text().collect::<String>(), clock) {
                    day = date;
                }
            }
            continue;
        }

        let content = el
            .select(&selectors.message_content)
            .map(|content| content.text().collect::<String>())
            .find(|text| !text.trim().is_empty())
            .unwrap_or_else(|| el.text().collect::<String>());
        let content = content.trim().to_string();
        if content.is_empty() {
            continue;
        }

        let sent_at = el
            .select(&selectors.message_time)
            .next()
            .and_then(|time| {
                time.value()
                    .attr("datetime")
                    .and_then(parse_machine_time)
                    .or_else(|| parse_display_time_on(&time.text().collect::<String>(), day, clock))
            })
            .or(previous_at)
            .unwrap_or_else(|| clock.at(day, NaiveTime::MIN));
        previous_at = Some(sent_at);

        messages.push(RawMessage {
            content,
            sent_at,
            direction: direction_of(el, selectors),
            channel: if selectors.system.matches(&el) {
                MessageChannel::System
            } else {
                MessageChannel::Chat
            },
        });
    }

    messages
}

/// Whether any ancestor of `el` matches `selector`.
fn within(el: ElementRef<'_>, selector: &Selector) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|ancestor| selector.matches(&ancestor))
}

fn direction_of(item: ElementRef<'_>, selectors: &CompiledSelectors) -> Direction {
    if selectors.outbound.matches(&item) || within(item, &selectors.outbound) {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

fn parse_machine_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let caps = DATE_RE.captures(raw)?;
    NaiveDate::from_ymd_opt(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
    )
}

/// A divider reads either as a full date or as `오늘`/`어제`.
fn parse_divider_date(raw: &str, clock: &MessageClock) -> Option<NaiveDate> {
    if let Some(date) = parse_date(raw) {
        return Some(date);
    }
    let text = raw.trim().to_lowercase();
    if text.starts_with("오늘") || text.starts_with("today") {
        Some(clock.today)
    } else if text.starts_with("어제") || text.starts_with("yesterday") {
        clock.today.pred_opt()
    } else {
        None
    }
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let caps = CLOCK_RE.captures(raw)?;
    let mut hour: u32 = caps[2].parse().ok()?;
    let minute: u32 = caps[3].parse().ok()?;
    match caps.get(1).map(|m| m.as_str()) {
        Some("오후" | "PM" | "pm") if hour < 12 => hour += 12,
        Some("오전" | "AM" | "am") if hour == 12 => hour = 0,
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Parse the human-readable time shown next to a bubble.
///
/// Accepts `14:05`, `오후 2:05`, `2025년 3월 1일`, `2025.03.01 14:05` and
/// similar. A bare clock means today; a bare date means midnight.
pub fn parse_display_time(raw: &str, clock: &MessageClock) -> Option<DateTime<Utc>> {
    parse_display_time_on(raw, clock.today, clock)
}

/// Like [`parse_display_time`], but a bare clock belongs to `day`.
pub fn parse_display_time_on(raw: &str, day: NaiveDate, clock: &MessageClock) -> Option<DateTime<Utc>> {
    match (parse_date(raw), parse_clock(raw)) {
        (None, None) => None,
        (date, time) => Some(clock.at(date.unwrap_or(day), time.unwrap_or(NaiveTime::MIN))),
    }
}

/// Parse the time shown on an inbox row: `3분 전`, `2 hours ago`, or any
/// format [`parse_display_time`] accepts.
pub fn parse_list_time(raw: &str, clock: &MessageClock, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = RELATIVE_RE.captures(raw) {
        let amount: i64 = caps[1].parse().ok()?;
        let ago = match &caps[2] {
            "분" | "minute" | "minutes" => Duration::minutes(amount),
            "시간" | "hour" | "hours" => Duration::hours(amount),
            _ => Duration::days(amount),
        };
        return Some(now - ago);
    }
    let text = raw.trim();
    if text.starts_with("방금") || text.eq_ignore_ascii_case("just now") {
        return Some(now);
    }
    parse_display_time(raw, clock)
}

// ---------------------------------------------------------------------------
// Inbox list
// ---------------------------------------------------------------------------

/// Read every conversation row on the inbox page.
///
/// A row's external key comes from its chat link (the row itself, an
/// enclosing anchor, or one inside it), falling back to a `data-room-id` or
/// `data-chat-id` attribute. Rows without any key are skipped; a page whose
/// rows all lack one is a parse error, since the selectors no longer fit.
pub fn parse_inbox(
    doc: &Html,
    selectors: &CompiledSelectors,
    key_pattern: &Regex,
    clock: &MessageClock,
    now: DateTime<Utc>,
) -> Result<Vec<RawSnapshot>> {
    let mut rows = 0usize;
    let mut snapshots = Vec::new();

    for item in doc.select(&selectors.inbox_item) {
        if within(item, &selectors.inbox_item) {
            continue;
        }
        rows += 1;

        let Some(external_key) = inbox_key(item, key_pattern) else {
            tracing::debug!(row = rows, "inbox row has no conversation id, skipping");
            continue;
        };

        let name = text_within(item, &selectors.inbox_name);
        let service = text_within(item, &selectors.inbox_service);
        let (category, location) = match service.as_deref().and_then(|s| s.split_once('∙')) {
            Some((category, location)) => (non_empty(category), non_empty(location)),
            None => (service.clone(), None),
        };
        let title = [name.as_deref(), service.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        // No badge on a row means nothing unread; a badge without digits
        // leaves the count unknown.
        let unread_count = match text_within(item, &selectors.inbox_unread) {
            Some(badge) => DIGITS_RE.find(&badge).and_then(|m| m.as_str().parse().ok()),
            None => Some(0),
        };

        snapshots.push(RawSnapshot {
            external_key,
            metadata: DisplayMetadata {
                title: non_empty(&title),
                counterpart: name,
                category,
                location,
                price: text_within(item, &selectors.inbox_price),
            },
            unread_count,
            last_message: text_within(item, &selectors.inbox_last_message),
            last_message_at: text_within(item, &selectors.inbox_time)
                .and_then(|raw| parse_list_time(&raw, clock, now)),
        });
    }

    if rows > 0 && snapshots.is_empty() {
        return Err(MirrorError::parse(format!(
            "none of {rows} inbox rows carried a conversation id"
        )));
    }
    Ok(snapshots)
}

fn inbox_key(item: ElementRef<'_>, key_pattern: &Regex) -> Option<String> {
    let from_href = |el: ElementRef<'_>| {
        el.value()
            .attr("href")
            .and_then(|href| key_pattern.captures(href))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    };

    std::iter::once(item)
        .chain(item.ancestors().filter_map(ElementRef::wrap))
        .chain(item.descendants().filter_map(ElementRef::wrap))
        .filter(|el| el.value().name() == "a")
        .find_map(from_href)
        .or_else(|| {
            ["data-room-id", "data-chat-id"]
                .into_iter()
                .find_map(|attr| item.value().attr(attr))
                .and_then(non_empty)
        })
}

/// First non-empty text under `item` matching `selector`, excluding `item` itself.
fn text_within(item: ElementRef<'_>, selector: &Selector) -> Option<String> {
    item.select(selector)
        .filter(|el| el.id() != item.id())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|text| !text.is_empty())
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
