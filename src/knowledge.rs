use std::{collections::HashMap, sync::OnceLock};

use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

const SITE_KNOWLEDGE_JSON: &str = include_str!("../data/site_knowledge.json");

/// Closed set of locales the site is served in. Every translation and
/// knowledge lookup is keyed by this enum so a missing locale is a compile
/// error, not a runtime fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locale {
    Ua,
    Pl,
    En,
    De,
}

impl Locale {
    pub const ALL: [Locale; 4] = [Locale::Ua, Locale::Pl, Locale::En, Locale::De];
    pub const DEFAULT: Locale = Locale::Ua;

    pub fn as_str(self) -> &'static str {
        match self {
            Locale::Ua => "ua",
            Locale::Pl => "pl",
            Locale::En => "en",
            Locale::De => "de",
        }
    }

    pub fn parse(value: &str) -> Option<Locale> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ua" | "uk" => Some(Locale::Ua),
            "pl" => Some(Locale::Pl),
            "en" => Some(Locale::En),
            "de" => Some(Locale::De),
            _ => None,
        }
    }

    pub fn parse_or_default(value: &str) -> Locale {
        Locale::parse(value).unwrap_or(Locale::DEFAULT)
    }

    /// Human-readable language name used to pin the model's reply language.
    pub fn language_name(self) -> &'static str {
        match self {
            Locale::Ua => "Ukrainian",
            Locale::Pl => "Polish",
            Locale::En => "English",
            Locale::De => "German",
        }
    }
}

#[derive(Serialize)]
pub struct Translations {
    pub chat_greeting: &'static str,
    pub chat_nudge: &'static str,
    pub chat_contact_cta: &'static str,
    pub chat_contact_prompt: &'static str,
    pub chat_contact_saved: &'static str,
    pub chat_contact_invalid: &'static str,
    pub chat_rating_prompt: &'static str,
    pub error_title: &'static str,
    pub ai_error_notice: &'static str,
    pub nav_home: &'static str,
    pub nav_pricing: &'static str,
    pub hero_title: &'static str,
    pub hero_subtitle: &'static str,
    pub hero_cta: &'static str,
    pub pricing_title: &'static str,
    pub pricing_subtitle: &'static str,
    pub timeline_label: &'static str,
    pub includes_label: &'static str,
    pub popular_badge: &'static str,
    pub contact_title: &'static str,
    pub working_hours_label: &'static str,
}

static UA: Translations = Translations {
    chat_greeting: "Привіт! 👋 Я ваш AI-помічник. Чим можу допомогти сьогодні?",
    chat_nudge: "Привіт! Можу допомогти підібрати послугу і орієнтовний бюджет.",
    chat_contact_cta: "Будь ласка, залиште e-mail або телефон — щоб ми надіслали пропозицію та зв'язалися.",
    chat_contact_prompt: "Залиште контакт — e-mail або телефон:",
    chat_contact_saved: "Дякуємо! Контакт збережено. Ми скоро зв'яжемося.",
    chat_contact_invalid: "Введіть коректний e-mail або телефон.",
    chat_rating_prompt: "Чи була розмова корисною? Оцініть, будь ласка.",
    error_title: "Помилка",
    ai_error_notice: "Вибачте, сталася помилка. Спробуйте ще раз або напишіть нам у месенджер.",
    nav_home: "Головна",
    nav_pricing: "Ціни",
    hero_title: "Сайти, що працюють на ваш бізнес",
    hero_subtitle: "Швидкі, сучасні веб-рішення — від лендінгу до SaaS.",
    hero_cta: "Обговорити проєкт",
    pricing_title: "Послуги та ціни",
    pricing_subtitle: "Прозорі ціни без прихованих платежів.",
    timeline_label: "Термін",
    includes_label: "Що входить",
    popular_badge: "Найпопулярніше",
    contact_title: "Зв'язатися з нами",
    working_hours_label: "Графік роботи",
};

static PL: Translations = Translations {
    chat_greeting: "Cześć! 👋 Jestem Twoim asystentem AI. W czym mogę dziś pomóc?",
    chat_nudge: "Cześć! Pomogę dobrać usługę i orientacyjny budżet.",
    chat_contact_cta: "Proszę zostawić e-mail lub telefon — wyślemy ofertę i skontaktujemy się.",
    chat_contact_prompt: "Zostaw kontakt — e-mail lub telefon:",
    chat_contact_saved: "Dziękujemy! Kontakt zapisany. Wkrótce się odezwiemy.",
    chat_contact_invalid: "Wprowadź poprawny e-mail lub telefon.",
    chat_rating_prompt: "Czy rozmowa była pomocna? Prosimy o ocenę.",
    error_title: "Błąd",
    ai_error_notice: "Przepraszamy, wystąpił błąd. Spróbuj ponownie lub napisz do nas w komunikatorze.",
    nav_home: "Strona główna",
    nav_pricing: "Cennik",
    hero_title: "Strony, które pracują na Twój biznes",
    hero_subtitle: "Szybkie, nowoczesne rozwiązania webowe — od landing page po SaaS.",
    hero_cta: "Omówić projekt",
    pricing_title: "Usługi i ceny",
    pricing_subtitle: "Przejrzyste ceny bez ukrytych opłat.",
    timeline_label: "Termin",
    includes_label: "Co zawiera",
    popular_badge: "Najpopularniejsze",
    contact_title: "Skontaktuj się z nami",
    working_hours_label: "Godziny pracy",
};

static EN: Translations = Translations {
    chat_greeting: "Hi! 👋 I'm your AI assistant. How can I help you today?",
    chat_nudge: "Hi! I can help you pick a service and a ballpark budget.",
    chat_contact_cta: "If convenient, please leave your email or phone so we can send an offer and get in touch.",
    chat_contact_prompt: "Leave your email or phone:",
    chat_contact_saved: "Thanks! Contact saved. We will reach out soon.",
    chat_contact_invalid: "Please enter a valid email or phone.",
    chat_rating_prompt: "Was this conversation helpful? Please rate it.",
    error_title: "Error",
    ai_error_notice: "Sorry, something went wrong. Please try again or message us directly.",
    nav_home: "Home",
    nav_pricing: "Pricing",
    hero_title: "Websites that work for your business",
    hero_subtitle: "Fast, modern web solutions — from landing pages to SaaS.",
    hero_cta: "Discuss a project",
    pricing_title: "Services & pricing",
    pricing_subtitle: "Transparent pricing with no hidden fees.",
    timeline_label: "Timeline",
    includes_label: "What's included",
    popular_badge: "Most popular",
    contact_title: "Get in touch",
    working_hours_label: "Working hours",
};

static DE: Translations = Translations {
    chat_greeting: "Hallo! 👋 Ich bin Ihr KI-Assistent. Wie kann ich heute helfen?",
    chat_nudge: "Hallo! Ich helfe gern bei der Auswahl einer Leistung und einem groben Budget.",
    chat_contact_cta: "Hinterlassen Sie gerne E-Mail oder Telefon — wir senden ein Angebot und melden uns.",
    chat_contact_prompt: "Hinterlassen Sie E-Mail oder Telefon:",
    chat_contact_saved: "Danke! Kontakt gespeichert. Wir melden uns bald.",
    chat_contact_invalid: "Bitte geben Sie eine gültige E-Mail oder Telefonnummer ein.",
    chat_rating_prompt: "War das Gespräch hilfreich? Bitte bewerten Sie es.",
    error_title: "Fehler",
    ai_error_notice: "Entschuldigung, etwas ist schiefgelaufen. Bitte versuchen Sie es erneut oder schreiben Sie uns direkt.",
    nav_home: "Startseite",
    nav_pricing: "Preise",
    hero_title: "Websites, die für Ihr Geschäft arbeiten",
    hero_subtitle: "Schnelle, moderne Weblösungen — von der Landingpage bis SaaS.",
    hero_cta: "Projekt besprechen",
    pricing_title: "Leistungen & Preise",
    pricing_subtitle: "Transparente Preise ohne versteckte Kosten.",
    timeline_label: "Zeitrahmen",
    includes_label: "Enthalten",
    popular_badge: "Am beliebtesten",
    contact_title: "Kontakt aufnehmen",
    working_hours_label: "Arbeitszeiten",
};

pub fn translations(locale: Locale) -> &'static Translations {
    match locale {
        Locale::Ua => &UA,
        Locale::Pl => &PL,
        Locale::En => &EN,
        Locale::De => &DE,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub title: String,
    pub description: String,
    pub price: String,
    #[serde(default)]
    pub price_note: String,
    pub timeline: String,
    #[serde(default)]
    pub popular: bool,
    #[serde(default)]
    pub includes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Studio {
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocaleKnowledge {
    pub studio: Studio,
    pub services: Vec<Service>,
    pub contact: HashMap<String, String>,
}

static KNOWLEDGE: OnceLock<HashMap<String, LocaleKnowledge>> = OnceLock::new();

fn knowledge_map() -> &'static HashMap<String, LocaleKnowledge> {
    KNOWLEDGE.get_or_init(|| {
        serde_json::from_str(SITE_KNOWLEDGE_JSON).expect("invalid data/site_knowledge.json")
    })
}

pub fn knowledge_for(locale: Locale) -> &'static LocaleKnowledge {
    let map = knowledge_map();
    map.get(locale.as_str())
        .unwrap_or_else(|| &map[Locale::DEFAULT.as_str()])
}

/// Startup check: every locale must carry the full knowledge set, with the
/// same service ids in the same order as the default locale.
pub fn verify_knowledge() -> Result<(), String> {
    let map = knowledge_map();
    let base = map
        .get(Locale::DEFAULT.as_str())
        .ok_or_else(|| format!("knowledge missing default locale {}", Locale::DEFAULT.as_str()))?;
    let base_ids: Vec<&str> = base.services.iter().map(|s| s.id.as_str()).collect();

    for locale in Locale::ALL {
        let entry = map
            .get(locale.as_str())
            .ok_or_else(|| format!("knowledge missing locale {}", locale.as_str()))?;
        if entry.studio.description.trim().is_empty() {
            return Err(format!("empty studio description for {}", locale.as_str()));
        }
        let ids: Vec<&str> = entry.services.iter().map(|s| s.id.as_str()).collect();
        if ids != base_ids {
            return Err(format!(
                "service ids for {} do not match default locale: {:?} vs {:?}",
                locale.as_str(),
                ids,
                base_ids
            ));
        }
        for service in &entry.services {
            if service.title.trim().is_empty()
                || service.price.trim().is_empty()
                || service.timeline.trim().is_empty()
            {
                return Err(format!(
                    "incomplete service {} for {}",
                    service.id,
                    locale.as_str()
                ));
            }
        }
        for key in ["telegram", "viber", "messenger"] {
            if entry.contact.get(key).map(String::as_str).unwrap_or("").is_empty() {
                return Err(format!("missing contact {key} for {}", locale.as_str()));
            }
        }
    }
    Ok(())
}

/// Renders the localized knowledge block injected into every prompt.
pub fn build_knowledge_block(locale: Locale) -> String {
    let data = knowledge_for(locale);
    let mut lines = Vec::new();
    lines.push(format!("Studio: {}", data.studio.description));
    lines.push("Services:".to_string());
    for service in &data.services {
        let mut head = format!(
            "- {}: price {}, timeline {}",
            service.title, service.price, service.timeline
        );
        if !service.price_note.is_empty() {
            head.push_str(&format!(" ({})", service.price_note));
        }
        lines.push(head);
        if !service.includes.is_empty() {
            lines.push(format!("  Includes: {}", service.includes.join(", ")));
        }
        if !service.description.is_empty() {
            lines.push(format!("  Note: {}", service.description));
        }
    }
    let mut contacts: Vec<(&String, &String)> = data.contact.iter().collect();
    contacts.sort();
    lines.push(format!(
        "Contacts: {}",
        contacts
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(" | ")
    ));
    lines.join("\n")
}

#[derive(Debug, Clone)]
pub struct KnowledgeDoc {
    pub title: String,
    pub content: String,
}

/// Naive substring search over supplementary documents; empty on error.
pub async fn fetch_relevant_docs(pool: &PgPool, query: &str, locale: Locale) -> Vec<KnowledgeDoc> {
    let needle = query.trim();
    if needle.is_empty() {
        return Vec::new();
    }
    let pattern = format!("%{needle}%");
    let rows = sqlx::query(
        "SELECT title, content FROM knowledge_documents \
         WHERE locale = $1 AND (title ILIKE $2 OR content ILIKE $2) \
         ORDER BY updated_at DESC LIMIT 5",
    )
    .bind(locale.as_str())
    .bind(&pattern)
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    rows.into_iter()
        .map(|row| KnowledgeDoc {
            title: row.get("title"),
            content: row.get("content"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knowledge_is_complete_for_every_locale() {
        verify_knowledge().expect("embedded knowledge must be complete");
    }

    #[test]
    fn ukrainian_landing_price_survives_into_block() {
        let block = build_knowledge_block(Locale::Ua);
        assert!(block.contains("Лендінг"));
        assert!(block.contains("$800 - $1,500"));
        assert!(block.contains("t.me/oleksiy_zhyvotivskyi"));
    }

    #[test]
    fn locale_parse_accepts_known_tags_only() {
        assert_eq!(Locale::parse("ua"), Some(Locale::Ua));
        assert_eq!(Locale::parse("UK"), Some(Locale::Ua));
        assert_eq!(Locale::parse("pl"), Some(Locale::Pl));
        assert_eq!(Locale::parse("fr"), None);
        assert_eq!(Locale::parse_or_default("xx"), Locale::Ua);
    }

    #[test]
    fn every_locale_has_distinct_greeting() {
        let mut seen = std::collections::HashSet::new();
        for locale in Locale::ALL {
            assert!(seen.insert(translations(locale).chat_greeting));
        }
    }
}
