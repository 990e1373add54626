use crate::knowledge::Locale;

// Keyword lists are deliberately small: common greetings plus the
// price/timeline vocabulary visitors actually use in the widget.
const UA_KEYWORDS: &[&str] = &[
    "привіт", "добрий", "скільки", "коштує", "вартість", "ціна", "сайт", "лендінг",
    "дякую", "замовити", "потрібен", "потрібна", "термін", "бюджет", "допоможіть",
];
const PL_KEYWORDS: &[&str] = &[
    "cześć", "witam", "dzień", "dobry", "ile", "kosztuje", "cena", "strona", "sklep",
    "dziękuję", "proszę", "termin", "budżet", "potrzebuję", "zamówić",
];
const EN_KEYWORDS: &[&str] = &[
    "hello", "hi", "how", "much", "price", "cost", "website", "landing", "thanks",
    "thank", "need", "order", "budget", "timeline", "store",
];
const DE_KEYWORDS: &[&str] = &[
    "hallo", "guten", "tag", "wie", "viel", "kostet", "preis", "webseite", "danke",
    "brauche", "bestellen", "angebot", "zeitrahmen", "bitte",
];

const UA_MARKERS: &[char] = &['і', 'ї', 'є', 'ґ'];
const PL_MARKERS: &[char] = &['ą', 'ć', 'ę', 'ł', 'ń', 'ś', 'ź', 'ż'];
const DE_MARKERS: &[char] = &['ä', 'ö', 'ü', 'ß'];

fn is_cyrillic(c: char) -> bool {
    ('\u{0400}'..='\u{04FF}').contains(&c)
}

fn keyword_score(words: &[&str], keywords: &[&str]) -> usize {
    words.iter().filter(|w| keywords.contains(*w)).count() * 2
}

fn marker_score(text: &str, markers: &[char]) -> usize {
    text.chars().filter(|c| markers.contains(c)).count()
}

/// Detects the language of a single message by keyword and diacritic
/// scoring over the supported locales.
///
/// Precedence: the highest score wins; any Cyrillic script weighs toward
/// `ua` (the closed locale set has no other Cyrillic member). A tie between
/// leaders, or an all-zero score, falls back to the page's active locale.
pub fn detect_language(text: &str, fallback: Locale) -> Locale {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let cyrillic = lowered.chars().filter(|c| is_cyrillic(*c)).count();
    let mut scores = [
        (Locale::Ua, keyword_score(&words, UA_KEYWORDS) + marker_score(&lowered, UA_MARKERS)),
        (Locale::Pl, keyword_score(&words, PL_KEYWORDS) + marker_score(&lowered, PL_MARKERS)),
        (Locale::En, keyword_score(&words, EN_KEYWORDS)),
        (Locale::De, keyword_score(&words, DE_KEYWORDS) + marker_score(&lowered, DE_MARKERS)),
    ];
    if cyrillic > 0 {
        scores[0].1 += 3;
    }

    let (best_locale, best) = scores
        .iter()
        .copied()
        .max_by_key(|(_, score)| *score)
        .unwrap_or((fallback, 0));
    if best == 0 {
        return fallback;
    }
    let leaders = scores.iter().filter(|(_, score)| *score == best).count();
    if leaders > 1 {
        return fallback;
    }
    best_locale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_supported_locale() {
        assert_eq!(detect_language("Скільки коштує лендінг?", Locale::En), Locale::Ua);
        assert_eq!(detect_language("Ile kosztuje strona internetowa?", Locale::Ua), Locale::Pl);
        assert_eq!(detect_language("How much does a website cost?", Locale::Ua), Locale::En);
        assert_eq!(detect_language("Wie viel kostet eine Webseite?", Locale::Ua), Locale::De);
    }

    #[test]
    fn cyrillic_without_keywords_still_leans_ukrainian() {
        assert_eq!(detect_language("Сколько стоит сайт?", Locale::En), Locale::Ua);
    }

    #[test]
    fn ambiguous_or_empty_falls_back_to_page_locale() {
        assert_eq!(detect_language("", Locale::Pl), Locale::Pl);
        assert_eq!(detect_language("ok", Locale::De), Locale::De);
        assert_eq!(detect_language("12345", Locale::En), Locale::En);
    }
}
