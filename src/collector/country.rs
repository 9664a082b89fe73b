//! ISO 3166 alpha-2 codes for beacons that carry a country name only.

use std::str::FromStr;

use celes::Country;

fn fold(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Exact name first, then celes' own alias table, then the shortest
/// official name the input is a prefix of ("United States" resolves to
/// "United States of America").
pub fn code_for_name(name: &str) -> Option<String> {
    let wanted = fold(name);
    if wanted.is_empty() || wanted == "unknown" {
        return None;
    }

    let countries = Country::get_countries();
    if let Some(country) = countries.iter().find(|c| fold(c.long_name) == wanted) {
        return Some(country.alpha2.to_string());
    }
    if let Ok(country) = Country::from_str(name.trim()) {
        return Some(country.alpha2.to_string());
    }

    countries
        .iter()
        .filter(|c| fold(c.long_name).starts_with(&wanted))
        .min_by_key(|c| c.long_name.len())
        .map(|c| c.alpha2.to_string())
}
