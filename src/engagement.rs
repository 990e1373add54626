use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Per-chat engagement lifecycle, persisted as one `engagement` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementState {
    IdleNew,
    Greeted,
    Engaged,
    AwaitingContact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementEvent {
    GreetingSeeded,
    UserMessage,
    ContactPromptShown,
    LeadCaptured,
}

impl EngagementState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngagementState::IdleNew => "idle-new",
            EngagementState::Greeted => "greeted",
            EngagementState::Engaged => "engaged",
            EngagementState::AwaitingContact => "awaiting-contact",
        }
    }

    pub fn parse(value: &str) -> EngagementState {
        match value {
            "greeted" => EngagementState::Greeted,
            "engaged" => EngagementState::Engaged,
            "awaiting-contact" => EngagementState::AwaitingContact,
            _ => EngagementState::IdleNew,
        }
    }

    pub fn apply(self, event: EngagementEvent) -> EngagementState {
        match (self, event) {
            (EngagementState::IdleNew, EngagementEvent::GreetingSeeded) => EngagementState::Greeted,
            (EngagementState::IdleNew | EngagementState::Greeted, EngagementEvent::UserMessage) => {
                EngagementState::Engaged
            }
            (_, EngagementEvent::ContactPromptShown) => EngagementState::AwaitingContact,
            (EngagementState::AwaitingContact, EngagementEvent::LeadCaptured) => {
                EngagementState::Engaged
            }
            (state, _) => state,
        }
    }
}

fn price_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(цена|вартість|скільки|бюджет|стоимость|срок|термін|price|budget|cost|timeline|how long|ile|koszt|cena|termin|preis|kostet|zeitrahmen)",
        )
        .expect("price intent regex")
    })
}

fn contact_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(контакт|email|e-mail|почта|пошта|телефон|phone|номер|contact|kontakt|telefon)")
            .expect("contact intent regex")
    })
}

fn ready_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(заказать|замовити|готов|готовий|start|начать|почати|купить|оплатить|order|zamówić|zamawiam|bestellen|kaufen)",
        )
        .expect("ready intent regex")
    })
}

/// Decides whether to solicit contact details after this user turn.
///
/// Fires immediately on an explicit contact request or readiness wording;
/// price/timeline interest alone needs three or more user turns of context.
/// Never fires once a lead exists.
pub fn wants_contact_prompt(query: &str, user_turns: usize, has_lead: bool) -> bool {
    if has_lead {
        return false;
    }
    if contact_re().is_match(query) || ready_re().is_match(query) {
        return true;
    }
    user_turns >= 3 && price_re().is_match(query)
}

#[derive(Debug, Clone, Copy)]
pub struct NudgeConfig {
    pub first_delay_ms: i64,
    pub idle_threshold_ms: i64,
    pub max_per_session: i64,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            first_delay_ms: 10_000,
            idle_threshold_ms: 120_000,
            max_per_session: 5,
        }
    }
}

/// What the planner knows about one chat when a nudge check comes in.
/// `idle_for_ms` and `since_load_ms` are reported by the page (the browser
/// owns "time since load"); everything else is server state.
#[derive(Debug, Clone, Copy)]
pub struct NudgeSituation {
    pub nudge_count: i64,
    pub last_nudge_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub has_lead: bool,
    pub idle_for_ms: i64,
    pub since_load_ms: i64,
}

/// Pure nudge decision; `now` is injected so tests drive a virtual clock.
pub fn plan_nudge(now: DateTime<Utc>, situation: &NudgeSituation, config: &NudgeConfig) -> bool {
    if situation.has_lead || situation.nudge_count >= config.max_per_session {
        return false;
    }
    if let Some(last) = situation.last_message_at {
        if (now - last).num_milliseconds() < config.idle_threshold_ms {
            return false;
        }
    }
    if let Some(last) = situation.last_nudge_at {
        if (now - last).num_milliseconds() < config.idle_threshold_ms {
            return false;
        }
    }
    if situation.nudge_count == 0 {
        situation.since_load_ms >= config.first_delay_ms
    } else {
        situation.idle_for_ms >= config.idle_threshold_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn state_machine_follows_named_transitions() {
        let s = EngagementState::IdleNew;
        let s = s.apply(EngagementEvent::GreetingSeeded);
        assert_eq!(s, EngagementState::Greeted);
        let s = s.apply(EngagementEvent::UserMessage);
        assert_eq!(s, EngagementState::Engaged);
        let s = s.apply(EngagementEvent::ContactPromptShown);
        assert_eq!(s, EngagementState::AwaitingContact);
        let s = s.apply(EngagementEvent::LeadCaptured);
        assert_eq!(s, EngagementState::Engaged);
        // Seeding twice does not regress an engaged chat.
        assert_eq!(
            s.apply(EngagementEvent::GreetingSeeded),
            EngagementState::Engaged
        );
    }

    #[test]
    fn state_round_trips_through_storage() {
        for state in [
            EngagementState::IdleNew,
            EngagementState::Greeted,
            EngagementState::Engaged,
            EngagementState::AwaitingContact,
        ] {
            assert_eq!(EngagementState::parse(state.as_str()), state);
        }
        assert_eq!(EngagementState::parse("garbage"), EngagementState::IdleNew);
    }

    #[test]
    fn contact_prompt_fires_on_explicit_intent() {
        assert!(wants_contact_prompt("можете дати контакт?", 1, false));
        assert!(wants_contact_prompt("I want to order a landing page", 1, false));
        assert!(!wants_contact_prompt("скільки коштує лендінг?", 1, false));
        assert!(wants_contact_prompt("скільки коштує лендінг?", 3, false));
        assert!(!wants_contact_prompt("give me your contact", 5, true));
    }

    #[test]
    fn first_nudge_waits_for_initial_delay() {
        let config = NudgeConfig::default();
        let mut situation = NudgeSituation {
            nudge_count: 0,
            last_nudge_at: None,
            last_message_at: None,
            has_lead: false,
            idle_for_ms: 0,
            since_load_ms: 5_000,
        };
        assert!(!plan_nudge(at(0), &situation, &config));
        situation.since_load_ms = 10_000;
        assert!(plan_nudge(at(0), &situation, &config));
    }

    #[test]
    fn later_nudges_need_idle_time_and_spacing() {
        let config = NudgeConfig::default();
        let mut situation = NudgeSituation {
            nudge_count: 1,
            last_nudge_at: Some(at(0)),
            last_message_at: None,
            has_lead: false,
            idle_for_ms: 300_000,
            since_load_ms: 300_000,
        };
        // Too soon after the previous nudge.
        assert!(!plan_nudge(at(60), &situation, &config));
        assert!(plan_nudge(at(180), &situation, &config));
        // A recent message suppresses the nudge entirely.
        situation.last_message_at = Some(at(150));
        assert!(!plan_nudge(at(180), &situation, &config));
    }

    #[test]
    fn nudges_stop_at_cap_and_after_lead() {
        let config = NudgeConfig::default();
        let situation = NudgeSituation {
            nudge_count: 5,
            last_nudge_at: Some(at(0)),
            last_message_at: None,
            has_lead: false,
            idle_for_ms: 999_000,
            since_load_ms: 999_000,
        };
        assert!(!plan_nudge(at(600), &situation, &config));
        let with_lead = NudgeSituation {
            nudge_count: 0,
            has_lead: true,
            ..situation
        };
        assert!(!plan_nudge(at(600), &with_lead, &config));
    }
}
