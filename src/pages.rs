use minijinja::{context, Environment};

use crate::knowledge::{knowledge_for, translations, Locale};

const BASE_TEMPLATE: &str = include_str!("templates/base.html.j2");
const HOME_TEMPLATE: &str = include_str!("templates/home.html.j2");
const PRICING_TEMPLATE: &str = include_str!("templates/pricing.html.j2");

fn page_env() -> Result<Environment<'static>, String> {
    let mut env = Environment::new();
    env.add_template("base.html.j2", BASE_TEMPLATE)
        .map_err(|err| format!("base template: {err}"))?;
    env.add_template("home.html.j2", HOME_TEMPLATE)
        .map_err(|err| format!("home template: {err}"))?;
    env.add_template("pricing.html.j2", PRICING_TEMPLATE)
        .map_err(|err| format!("pricing template: {err}"))?;
    Ok(env)
}

fn render_page(
    template: &str,
    locale: Locale,
    page_path: &str,
    working_hours: &str,
) -> Result<String, String> {
    let env = page_env()?;
    let page = env
        .get_template(template)
        .map_err(|err| format!("{template}: {err}"))?;
    let data = knowledge_for(locale);
    page.render(context! {
        locale => locale.as_str(),
        locales => Locale::ALL.iter().map(|l| l.as_str()).collect::<Vec<_>>(),
        page_path => page_path,
        t => translations(locale),
        studio => &data.studio,
        services => &data.services,
        contact => &data.contact,
        working_hours => working_hours,
    })
    .map_err(|err| format!("{template}: {err}"))
}

pub fn render_home(locale: Locale, working_hours: &str) -> Result<String, String> {
    render_page("home.html.j2", locale, "", working_hours)
}

pub fn render_pricing(locale: Locale, working_hours: &str) -> Result<String, String> {
    render_page("pricing.html.j2", locale, "/pricing", working_hours)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_renders_localized_hero_and_services() {
        let html = render_home(Locale::Ua, "Пн-Пт 9:00-18:00").unwrap();
        assert!(html.contains("Сайти, що працюють на ваш бізнес"));
        assert!(html.contains("Лендінг"));
        assert!(html.contains("Пн-Пт 9:00-18:00"));
    }

    #[test]
    fn pricing_lists_prices_and_includes() {
        let html = render_pricing(Locale::En, "Mon-Fri 9:00-18:00 CET").unwrap();
        assert!(html.contains("$800 - $1,500"));
        assert!(html.contains("Responsive design"));
        assert!(html.contains("Most popular"));
    }

    #[test]
    fn locale_switcher_links_every_locale() {
        let html = render_pricing(Locale::De, "Mo-Fr 9:00-18:00").unwrap();
        for locale in Locale::ALL {
            assert!(html.contains(&format!("/{}{}", locale.as_str(), "/pricing")));
        }
    }
}
