use std::collections::BTreeMap;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use regex::RegexBuilder;
use serde_json::Value;
use tracing::debug;

use crate::config::{env_non_empty, env_value};
use crate::http::{Auth, Session};

pub const DEFAULT_SERVER: &str = "https://aeadataeditors.atlassian.net";
const DCAF_PRIVATE_MARKER: &str = "Yes, data can be made available privately";
const TITLE_SCAN_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Doi,
    OpenIcpsrUrl,
    DcafPrivate,
    ManuscriptId,
    ManuscriptTitle,
    SivacorId,
}

impl FromStr for Keyword {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "doi" => Ok(Self::Doi),
            "openicpsrurl" => Ok(Self::OpenIcpsrUrl),
            "dcaf_private" => Ok(Self::DcafPrivate),
            "mcid" => Ok(Self::ManuscriptId),
            "mctitle" => Ok(Self::ManuscriptTitle),
            "sivacorid" => Ok(Self::SivacorId),
            _ => bail!(
                "Unknown keyword: {value} (available: doi, openicpsrurl, dcaf_private, mcid, mctitle, sivacorid)"
            ),
        }
    }
}

pub trait JiraApi {
    /// Field display name to field id.
    fn field_map(&mut self) -> Result<BTreeMap<String, String>>;
    /// The `fields` object of an issue.
    fn issue_fields(&mut self, key: &str) -> Result<Value>;
}

pub struct JiraClient {
    session: Session,
    server: String,
    auth: Auth,
}

impl JiraClient {
    /// `None` when `JIRA_USERNAME` or `JIRA_API_KEY` is unset.
    pub fn from_env(session: Session) -> Option<Self> {
        let username = env_non_empty("JIRA_USERNAME")?;
        let password = env_non_empty("JIRA_API_KEY")?;
        Some(Self {
            session,
            server: env_value("JIRA_SERVER", DEFAULT_SERVER)
                .trim_end_matches('/')
                .to_string(),
            auth: Auth::Basic { username, password },
        })
    }
}

impl JiraApi for JiraClient {
    fn field_map(&mut self) -> Result<BTreeMap<String, String>> {
        let url = format!("{}/rest/api/2/field", self.server);
        let fields = self.session.get_json(&url, &self.auth)?;
        let mut map = BTreeMap::new();
        for field in fields.as_array().context("field list is not an array")? {
            if let (Some(name), Some(id)) = (
                field.get("name").and_then(Value::as_str),
                field.get("id").and_then(Value::as_str),
            ) {
                map.insert(name.to_string(), id.to_string());
            }
        }
        Ok(map)
    }

    fn issue_fields(&mut self, key: &str) -> Result<Value> {
        let url = format!("{}/rest/api/2/issue/{key}", self.server);
        let issue = self.session.get_json(&url, &self.auth)?;
        issue
            .get("fields")
            .cloned()
            .with_context(|| format!("issue {key} has no fields"))
    }
}

/// Text rendering of a field value; select options contribute their `value`.
pub fn field_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => match number.as_f64() {
            Some(float) if float.fract() == 0.0 && float.abs() < 1e15 => format!("{}", float as i64),
            _ => number.to_string(),
        },
        Value::Array(items) => items
            .iter()
            .filter_map(field_text)
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(map) => ["value", "name", "displayName"]
            .iter()
            .find_map(|key| map.get(*key).and_then(field_text))?,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}

struct IssueView<'a> {
    fields: &'a Value,
    field_map: &'a BTreeMap<String, String>,
}

impl IssueView<'_> {
    fn raw(&self, name: &str) -> Option<&Value> {
        let id = self.field_map.get(name)?;
        self.fields.get(id)
    }

    fn text(&self, name: &str) -> Option<String> {
        self.raw(name).and_then(field_text)
    }
}

fn doi(view: &IssueView<'_>) -> String {
    if let Some(doi) = view.text("RepositoryDOI") {
        return doi;
    }
    match view.text("openICPSR Project Number") {
        Some(number) => {
            let version = view
                .text("openICPSRversion")
                .unwrap_or_else(|| "V1".to_string());
            format!("https://doi.org/10.3886/E{number}{version}")
        }
        None => String::new(),
    }
}

fn dcaf_private(view: &IssueView<'_>) -> String {
    let matches = match view.raw("DCAF_Access_Restrictions_V2") {
        Some(Value::Array(items)) => items.iter().any(|item| {
            field_text(item).is_some_and(|text| text.contains(DCAF_PRIVATE_MARKER))
        }),
        Some(value) => field_text(value).is_some_and(|text| text.contains(DCAF_PRIVATE_MARKER)),
        None => false,
    };
    if matches { "yes".to_string() } else { String::new() }
}

/// Title quoted after `entitled` within the first lines of a description.
pub fn manuscript_title(description: &str) -> Result<String> {
    let pattern = RegexBuilder::new(r#"entitled\s+["']([^"']+)["']"#)
        .case_insensitive(true)
        .build()
        .context("invalid title pattern")?;
    for line in description.split('\n').take(TITLE_SCAN_LINES) {
        if let Some(found) = pattern.captures(line).and_then(|captures| captures.get(1)) {
            return Ok(found.as_str().trim().trim_end_matches(',').to_string());
        }
    }
    Ok(String::new())
}

/// Resolve `keyword` against an issue. Lookup failures yield an empty answer.
pub fn get_info(api: &mut dyn JiraApi, issue_key: &str, keyword: Keyword) -> Result<String> {
    let key = issue_key.trim().to_ascii_uppercase();
    let fields = match api.issue_fields(&key) {
        Ok(fields) => fields,
        Err(error) => {
            debug!(%key, %error, "issue lookup failed");
            return Ok(String::new());
        }
    };
    let field_map = api.field_map().unwrap_or_else(|error| {
        debug!(%error, "field list unavailable");
        BTreeMap::new()
    });
    let view = IssueView {
        fields: &fields,
        field_map: &field_map,
    };
    Ok(match keyword {
        Keyword::Doi => doi(&view),
        Keyword::OpenIcpsrUrl => view.text("openICPSR alternate URL").unwrap_or_default(),
        Keyword::DcafPrivate => dcaf_private(&view),
        Keyword::ManuscriptId => view
            .text("Manuscript Central identifier")
            .unwrap_or_default(),
        Keyword::ManuscriptTitle => match fields.get("description").and_then(Value::as_str) {
            Some(description) => manuscript_title(description)?,
            None => String::new(),
        },
        Keyword::SivacorId => view.text("SIVACOR ID").unwrap_or_default(),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use anyhow::{Result, bail};
    use serde_json::Value;

    use super::JiraApi;

    #[derive(Default)]
    pub struct MockJira {
        pub fields: BTreeMap<String, String>,
        pub issues: BTreeMap<String, Value>,
        pub requested: Vec<String>,
    }

    impl JiraApi for MockJira {
        fn field_map(&mut self) -> Result<BTreeMap<String, String>> {
            Ok(self.fields.clone())
        }

        fn issue_fields(&mut self, key: &str) -> Result<Value> {
            self.requested.push(key.to_string());
            match self.issues.get(key) {
                Some(fields) => Ok(fields.clone()),
                None => bail!("issue does not exist"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::testing::MockJira;
    use super::*;

    fn mock(fields: Value) -> MockJira {
        MockJira {
            fields: BTreeMap::from([
                ("RepositoryDOI".to_string(), "customfield_1".to_string()),
                ("openICPSR Project Number".to_string(), "customfield_2".to_string()),
                ("openICPSRversion".to_string(), "customfield_3".to_string()),
                ("DCAF_Access_Restrictions_V2".to_string(), "customfield_4".to_string()),
                ("Manuscript Central identifier".to_string(), "customfield_5".to_string()),
                ("SIVACOR ID".to_string(), "customfield_6".to_string()),
                ("openICPSR alternate URL".to_string(), "customfield_7".to_string()),
            ]),
            issues: BTreeMap::from([("AEAREP-8361".to_string(), fields)]),
            requested: Vec::new(),
        }
    }

    #[test]
    fn keywords_parse_case_insensitively() {
        assert_eq!("DOI".parse::<Keyword>().expect("doi"), Keyword::Doi);
        assert_eq!("SivacorID".parse::<Keyword>().expect("sivacor"), Keyword::SivacorId);
        assert!("title".parse::<Keyword>().is_err());
    }

    #[test]
    fn doi_prefers_repository_doi() {
        let mut api = mock(json!({"customfield_1": " 10.3886/E1V2 ", "customfield_2": 5}));
        assert_eq!(
            get_info(&mut api, "aearep-8361", Keyword::Doi).expect("doi"),
            "10.3886/E1V2"
        );
        assert_eq!(api.requested, vec!["AEAREP-8361".to_string()]);
    }

    #[test]
    fn doi_is_built_from_openicpsr_fields() {
        let mut api = mock(json!({"customfield_1": null, "customfield_2": 192345.0}));
        assert_eq!(
            get_info(&mut api, "AEAREP-8361", Keyword::Doi).expect("doi"),
            "https://doi.org/10.3886/E192345V1"
        );
        let mut api = mock(json!({"customfield_2": "192345", "customfield_3": "V3"}));
        assert_eq!(
            get_info(&mut api, "AEAREP-8361", Keyword::Doi).expect("doi"),
            "https://doi.org/10.3886/E192345V3"
        );
    }

    #[test]
    fn dcaf_private_checks_lists_and_strings() {
        let mut api = mock(json!({"customfield_4": [
            {"value": "No"},
            {"value": "Yes, data can be made available privately to the replicator"}
        ]}));
        assert_eq!(
            get_info(&mut api, "AEAREP-8361", Keyword::DcafPrivate).expect("dcaf"),
            "yes"
        );
        let mut api = mock(json!({"customfield_4": "No restrictions"}));
        assert_eq!(
            get_info(&mut api, "AEAREP-8361", Keyword::DcafPrivate).expect("dcaf"),
            ""
        );
    }

    #[test]
    fn simple_fields_are_trimmed() {
        let mut api = mock(json!({
            "customfield_5": "AEJApp-2024-0001 ",
            "customfield_6": {"value": "ABC123"},
            "customfield_7": "https://www.openicpsr.org/openicpsr/project/1/version/V1/view"
        }));
        assert_eq!(
            get_info(&mut api, "AEAREP-8361", Keyword::ManuscriptId).expect("mcid"),
            "AEJApp-2024-0001"
        );
        assert_eq!(
            get_info(&mut api, "AEAREP-8361", Keyword::SivacorId).expect("sivacor"),
            "ABC123"
        );
        assert!(
            get_info(&mut api, "AEAREP-8361", Keyword::OpenIcpsrUrl)
                .expect("url")
                .starts_with("https://www.openicpsr.org/")
        );
    }

    #[test]
    fn manuscript_title_is_read_from_description() {
        let description = "Dear author,\nyour manuscript entitled \"Trade and Growth,\" was received.";
        assert_eq!(manuscript_title(description).expect("title"), "Trade and Growth");
        assert_eq!(
            manuscript_title("ENTITLED 'Single Quotes'").expect("title"),
            "Single Quotes"
        );
        let late = format!("{}entitled \"Too Late\"", "line\n".repeat(10));
        assert_eq!(manuscript_title(&late).expect("title"), "");
    }

    #[test]
    fn missing_issue_yields_empty_answer() {
        let mut api = mock(json!({}));
        assert_eq!(
            get_info(&mut api, "AEAREP-1", Keyword::Doi).expect("empty"),
            ""
        );
    }
}
