//! Field-name alias resolution for untyped input rows (spec Section 6).
//!
//! `resolverd::ingest` calls this at load time to turn whatever the source
//! file's header row says into the concept the rest of the pipeline cares
//! about. Case-insensitive, first match wins.

/// A concept the core needs to find among a row's raw field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concept {
    Identifier,
    Name,
    Siret,
    Siren,
    Nif,
    Address1,
    Address2,
    Address3,
    Postal,
    City,
}

impl Concept {
    /// Aliases in priority order, matching spec Section 6's table.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Identifier => &["auxiliaire", "code tiers", "index"],
            Self::Name => &["nom", "name", "company name", "raison sociale"],
            Self::Siret => &["code siret"],
            Self::Siren => &["code siren"],
            Self::Nif => &["code nif"],
            Self::Address1 => &["adresse 1"],
            Self::Address2 => &["adresse 2"],
            Self::Address3 => &["adresse 3"],
            Self::Postal => &["postal", "code postal", "cp", "zip"],
            Self::City => &["ville", "city", "commune"],
        }
    }
}

/// Find the raw field name (preserving the source's own casing) in `headers`
/// that matches `concept`'s first alias, case-insensitively.
pub fn resolve<'a>(headers: &'a [String], concept: Concept) -> Option<&'a str> {
    for alias in concept.aliases() {
        if let Some(h) = headers.iter().find(|h| h.to_lowercase() == *alias) {
            return Some(h.as_str());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_identifier_case_insensitively() {
        let headers = vec!["Code Tiers".to_string(), "Nom".to_string()];
        assert_eq!(resolve(&headers, Concept::Identifier), Some("Code Tiers"));
    }

    #[test]
    fn first_alias_wins_when_multiple_present() {
        let headers = vec!["ZIP".to_string(), "Postal".to_string()];
        // "postal" is listed before "zip" in the alias table.
        assert_eq!(resolve(&headers, Concept::Postal), Some("Postal"));
    }

    #[test]
    fn returns_none_when_absent() {
        let headers = vec!["Unrelated".to_string()];
        assert_eq!(resolve(&headers, Concept::City), None);
    }
}
