//! Source adapter contracts and the two site adapters.
//!
//! An adapter knows how to list the homes a site publishes and how to turn a
//! single detail page into a typed record. Fetching goes through the shared
//! [`HttpFetcher`]; pacing, checkpoints and failure accounting belong to the
//! collector in `ltc-sync`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ltc_core::{
    normalize_name, LocationDetails, LocationRecord, MetricsRecord, QualityMetrics, PROVINCIAL_AVERAGE_NAME,
};
use ltc_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ltc-adapters";

/// Which half of the facility record a source contributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Metrics,
    Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A home discovered during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeRef {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("no data on page for {0}")]
    NoData(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    type Record: Send + Sync;

    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    /// Ordered list of homes to visit. Order is stable between runs so that a
    /// checkpoint offset keeps pointing at the same home.
    async fn enumerate(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<HomeRef>, AdapterError>;

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &HomeRef,
    ) -> Result<FetchedPage, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, self.source_id(), &target.url)
            .await?;
        Ok(FetchedPage {
            url: resp.final_url,
            content_type: resp.content_type.unwrap_or_else(|| "text/html".into()),
            body: resp.body,
            fetched_at: Utc::now(),
        })
    }

    fn parse_detail(&self, target: &HomeRef, page: &FetchedPage) -> Result<Self::Record, AdapterError>;
}

/// Collapses inner whitespace; empty strings and a lone `-` mean "no value".
pub fn clean_text(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed == "-" {
        None
    } else {
        Some(collapsed)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(format!("selector {selector}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    clean_text(&element.text().collect::<String>())
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

fn select_first_attr(document: &Html, selector: &str, attr: &str) -> Result<Option<String>, AdapterError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(clean_text))
}

/// First decimal number in `text`, e.g. `"12.3 %"` gives `12.3`.
pub fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse().ok()
}

fn first_integer(text: &str) -> Option<u32> {
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Public Reporting (location and administrative details)
// ---------------------------------------------------------------------------

const PROFILE_PREFIX: &str = "#ctl00_ContentPlaceHolder1_";

#[derive(Debug, Clone)]
pub struct PublicReportingAdapter {
    source_id: String,
    listing_url: String,
}

impl PublicReportingAdapter {
    pub fn new(source_id: impl Into<String>, listing_url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url: listing_url.into(),
        }
    }
}

/// Home profile links on a listing page. Link texts of five characters or
/// fewer are navigation, not homes.
pub fn parse_listing(html: &str, base_url: &str) -> Result<Vec<HomeRef>, AdapterError> {
    let base = Url::parse(base_url).map_err(|e| AdapterError::Message(format!("listing url {base_url}: {e}")))?;
    let document = Html::parse_document(html);
    let sel = parse_selector(r#"a[href*="homeprofile.aspx"]"#)?;

    let mut homes = Vec::new();
    for link in document.select(&sel) {
        let Some(name) = element_text(link) else {
            continue;
        };
        if name.chars().count() <= 5 {
            continue;
        }
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        match base.join(href) {
            Ok(url) => homes.push(HomeRef {
                name,
                url: url.to_string(),
            }),
            Err(err) => debug!(href, error = %err, "skipping unresolvable profile link"),
        }
    }
    Ok(homes)
}

/// Home profile page: header block plus label/value rows.
pub fn parse_home_profile(html: &str, fallback_name: &str) -> Result<LocationRecord, AdapterError> {
    let document = Html::parse_document(html);
    let header = |id: &str| select_first_text(&document, &format!("{PROFILE_PREFIX}{id}"));

    let name = header("divHomeName")?
        .or_else(|| clean_text(fallback_name))
        .ok_or_else(|| AdapterError::NoData(fallback_name.to_string()))?;

    let mut details = LocationDetails {
        address: header("divHomeAddress")?,
        phone: header("divHomePhone")?.and_then(|v| clean_text(&v.replace("Tel :", ""))),
        fax: header("divHomeFax")?.and_then(|v| clean_text(&v.replace("Fax :", ""))),
        website: select_first_attr(&document, &format!("{PROFILE_PREFIX}divHomeWebsite a"), "href")?,
        ..Default::default()
    };

    if let Some(city_postal) = header("divHomeCity")? {
        let parts: Vec<&str> = city_postal.split(',').map(str::trim).collect();
        if let [city, postal] = parts.as_slice() {
            details.city = clean_text(city);
            details.postal_code = clean_text(postal);
        } else {
            details.city = Some(city_postal);
        }
    }

    let row_sel = parse_selector(".Profilerow, .Profilerow_alternate")?;
    let label_sel = parse_selector(".Profilerow_col1")?;
    let value_sel = parse_selector(".Profilerow_col2")?;
    for row in document.select(&row_sel) {
        let label = row.select(&label_sel).next().and_then(element_text);
        let value = row.select(&value_sel).next().and_then(element_text);
        if let (Some(label), Some(value)) = (label, value) {
            apply_profile_row(&mut details, &label, value);
        }
    }

    Ok(LocationRecord { name, details })
}

fn apply_profile_row(details: &mut LocationDetails, label: &str, value: String) {
    if label.contains("Local Health Integration Network") {
        details.lhin = Some(value);
    } else if label.contains("Home, Community and Residential Care") {
        details.home_community_care = Some(value);
    } else if label.contains("French Language Services") {
        details.french_language_services = Some(value);
    } else {
        match label {
            "Home Administrator" => details.home_administrator = Some(value),
            "Licensee" => details.licensee = Some(value),
            "Management Firm" => details.management_firm = Some(value),
            "Home Type" => details.home_type = Some(value),
            "Licensed Beds" => {
                details.licensed_beds = first_integer(&value);
                details.licensed_beds_text = Some(value);
            }
            "Approved Short Stay Beds" => details.approved_short_stay_beds = Some(value),
            "Residents' Council" => details.residents_council = Some(value),
            "Family Council" => details.family_council = Some(value),
            "Accreditation" => details.accreditation = Some(value),
            _ => {}
        }
    }
}

#[async_trait]
impl SourceAdapter for PublicReportingAdapter {
    type Record = LocationRecord;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Location
    }

    async fn enumerate(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<HomeRef>, AdapterError> {
        let resp = http
            .fetch_bytes(ctx.run_id, &self.source_id, &self.listing_url)
            .await?;
        parse_listing(&resp.text(), &self.listing_url)
    }

    fn parse_detail(&self, target: &HomeRef, page: &FetchedPage) -> Result<LocationRecord, AdapterError> {
        parse_home_profile(&page.text(), &target.name)
    }
}

// ---------------------------------------------------------------------------
// HQO metrics
// ---------------------------------------------------------------------------

/// Names discovered ahead of collection, e.g. from the site's search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HomeList {
    #[serde(default)]
    pub total_homes: Option<usize>,
    #[serde(default)]
    pub discovered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: Option<String>,
    pub homes: Vec<String>,
}

impl HomeList {
    /// Upper-cased, de-duplicated and sorted, the way the metrics site lists
    /// homes. Blank names are dropped.
    pub fn from_names<I, S>(names: I, discovered_at: DateTime<Utc>, source: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let homes: BTreeSet<String> = names
            .into_iter()
            .filter_map(|name| clean_text(name.as_ref()))
            .map(|name| normalize_name(&name))
            .collect();
        Self {
            total_homes: Some(homes.len()),
            discovered_at: Some(discovered_at),
            source: Some(source.into()),
            homes: homes.into_iter().collect(),
        }
    }
}

const METRIC_SELECTORS: [&str; 8] = [
    "#long-term-care-number",
    "#long-term-care-number-forhospital",
    "#second-number",
    "#third-number",
    "#fourth-number",
    "#fifth-number",
    "#sixth-number",
    "#seventh-number",
];

#[derive(Debug, Clone)]
pub struct HqoMetricsAdapter {
    source_id: String,
    detail_url: String,
    query_param: String,
    item_list_path: PathBuf,
    provincial_url: Option<String>,
}

impl HqoMetricsAdapter {
    pub fn new(
        source_id: impl Into<String>,
        detail_url: impl Into<String>,
        query_param: impl Into<String>,
        item_list_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            detail_url: detail_url.into(),
            query_param: query_param.into(),
            item_list_path: item_list_path.into(),
            provincial_url: None,
        }
    }

    /// Also collect the province-wide averages from `url`, ahead of the homes.
    pub fn with_provincial_url(mut self, url: impl Into<String>) -> Self {
        self.provincial_url = Some(url.into());
        self
    }

    pub fn detail_url_for(&self, name: &str) -> Result<String, AdapterError> {
        let mut url = Url::parse(&self.detail_url)
            .map_err(|e| AdapterError::Message(format!("detail url {}: {e}", self.detail_url)))?;
        url.query_pairs_mut().append_pair(&self.query_param, name);
        Ok(url.to_string())
    }

    pub async fn load_home_list(&self) -> anyhow::Result<HomeList> {
        ltc_storage::read_json(&self.item_list_path)
            .await
            .with_context(|| format!("loading home list for {}", self.source_id))
    }
}

fn read_metrics(document: &Html) -> Result<QualityMetrics, AdapterError> {
    let mut values = [None; 8];
    for (slot, selector) in values.iter_mut().zip(METRIC_SELECTORS) {
        *slot = select_first_text(document, selector)?
            .as_deref()
            .and_then(first_number);
    }
    let [wait_time_community, wait_time_hospital, antipsychotic_use, falls, restraints, pressure_ulcers, pain, depression] =
        values;
    Ok(QualityMetrics {
        wait_time_community,
        wait_time_hospital,
        antipsychotic_use,
        falls,
        restraints,
        pressure_ulcers,
        pain,
        depression,
    })
}

/// Metrics page for one home. A page without a rendered name carries no data.
pub fn parse_metrics_page(html: &str, requested_name: &str) -> Result<MetricsRecord, AdapterError> {
    let document = Html::parse_document(html);
    let name = select_first_text(&document, "#hospital-filter-name")?
        .ok_or_else(|| AdapterError::NoData(requested_name.to_string()))?;

    Ok(MetricsRecord {
        name,
        metrics: read_metrics(&document)?,
        is_provincial: false,
    })
}

/// Landing page before any home is picked: the province-wide averages. The
/// community wait time must be rendered; there is no hospital wait time at
/// this level.
pub fn parse_provincial_page(html: &str) -> Result<MetricsRecord, AdapterError> {
    let document = Html::parse_document(html);
    let mut metrics = read_metrics(&document)?;
    if metrics.wait_time_community.is_none() {
        return Err(AdapterError::NoData(PROVINCIAL_AVERAGE_NAME.to_string()));
    }
    metrics.wait_time_hospital = None;

    Ok(MetricsRecord {
        name: PROVINCIAL_AVERAGE_NAME.to_string(),
        metrics,
        is_provincial: true,
    })
}

#[async_trait]
impl SourceAdapter for HqoMetricsAdapter {
    type Record = MetricsRecord;

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Metrics
    }

    async fn enumerate(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<HomeRef>, AdapterError> {
        let list = self.load_home_list().await?;
        let mut homes: Vec<HomeRef> = self
            .provincial_url
            .iter()
            .map(|url| HomeRef {
                name: PROVINCIAL_AVERAGE_NAME.to_string(),
                url: url.clone(),
            })
            .collect();
        for name in list.homes.iter().filter_map(|name| clean_text(name)) {
            let url = self.detail_url_for(&name)?;
            homes.push(HomeRef { name, url });
        }
        Ok(homes)
    }

    fn parse_detail(&self, target: &HomeRef, page: &FetchedPage) -> Result<MetricsRecord, AdapterError> {
        if self.provincial_url.is_some() && target.name == PROVINCIAL_AVERAGE_NAME {
            parse_provincial_page(&page.text())
        } else {
            parse_metrics_page(&page.text(), &target.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(source_id: &str, file: &str) -> String {
        let path = workspace_root().join("fixtures").join(source_id).join(file);
        fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn page(html: String) -> FetchedPage {
        FetchedPage {
            url: "https://example.test/".into(),
            content_type: "text/html".into(),
            body: html.into_bytes(),
            fetched_at: Utc::now(),
        }
    }

    #[test]
    fn clean_text_collapses_whitespace_and_blanks() {
        assert_eq!(clean_text("  Jane \n  Doe "), Some("Jane Doe".into()));
        assert_eq!(clean_text("   "), None);
        assert_eq!(clean_text(" - "), None);
    }

    #[test]
    fn first_number_takes_leading_decimal() {
        assert_eq!(first_number("12.3 %"), Some(12.3));
        assert_eq!(first_number("118 days"), Some(118.0));
        assert_eq!(first_number("about 4. then 5"), Some(4.0));
        assert_eq!(first_number("N/A"), None);
    }

    #[test]
    fn listing_keeps_profile_links_with_real_names() {
        let html = fixture("public-reporting", "listing.html");
        let homes = parse_listing(&html, "https://publicreporting.ltchomes.net/en-ca/Search_Selection.aspx").unwrap();

        let names: Vec<_> = homes.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Maple Manor", "Riverside Long-Term Care", "St. Joseph's Villa"]
        );
        assert_eq!(
            homes[0].url,
            "https://publicreporting.ltchomes.net/en-ca/homeprofile.aspx?Home=2695&tab=0"
        );
        assert!(homes[2].url.contains("Home=M501"));
    }

    #[test]
    fn home_profile_parses_header_and_rows() {
        let adapter = PublicReportingAdapter::new("public-reporting", "https://example.test/");
        let target = HomeRef {
            name: "Maple Manor".into(),
            url: "https://example.test/homeprofile.aspx?Home=2695".into(),
        };
        let record = adapter
            .parse_detail(&target, &page(fixture("public-reporting", "home_profile.html")))
            .unwrap();

        assert_eq!(record.name, "Maple Manor");
        let d = &record.details;
        assert_eq!(d.address.as_deref(), Some("12 Elm Street"));
        assert_eq!(d.city.as_deref(), Some("Ottawa"));
        assert_eq!(d.postal_code.as_deref(), Some("K1N 6N5"));
        assert_eq!(d.phone.as_deref(), Some("613-555-0101"));
        assert_eq!(d.fax.as_deref(), Some("613-555-0102"));
        assert_eq!(d.website.as_deref(), Some("https://maplemanor.example.ca"));
        assert_eq!(d.lhin.as_deref(), Some("Champlain"));
        assert_eq!(
            d.home_community_care.as_deref(),
            Some("Home and Community Care Support Services Champlain")
        );
        assert_eq!(d.home_administrator.as_deref(), Some("Jane Doe"));
        assert_eq!(d.licensee.as_deref(), Some("Maple Care Inc."));
        assert_eq!(d.management_firm, None);
        assert_eq!(d.home_type.as_deref(), Some("Non-Profit"));
        assert_eq!(d.licensed_beds, Some(128));
        assert_eq!(d.licensed_beds_text.as_deref(), Some("Home with approximately 128 beds"));
        assert_eq!(d.approved_short_stay_beds.as_deref(), Some("2"));
        assert_eq!(d.residents_council.as_deref(), Some("Yes"));
        assert_eq!(d.family_council.as_deref(), Some("No"));
        assert_eq!(d.accreditation.as_deref(), Some("Yes"));
        assert_eq!(d.french_language_services.as_deref(), Some("Designated"));
    }

    #[test]
    fn city_without_postal_is_kept_whole() {
        let html = r#"<div id="ctl00_ContentPlaceHolder1_divHomeCity">Thunder Bay</div>"#;
        let record = parse_home_profile(html, "Bayshore Residence").unwrap();
        assert_eq!(record.name, "Bayshore Residence");
        assert_eq!(record.details.city.as_deref(), Some("Thunder Bay"));
        assert_eq!(record.details.postal_code, None);
    }

    #[test]
    fn profile_without_any_name_is_rejected() {
        let err = parse_home_profile("<html></html>", "  ").unwrap_err();
        assert!(matches!(err, AdapterError::NoData(_)));
    }

    #[test]
    fn metrics_page_extracts_eight_indicators() {
        let record = parse_metrics_page(&fixture("hqo-metrics", "home.html"), "MAPLE MANOR").unwrap();
        assert_eq!(record.name, "MAPLE MANOR");
        let m = &record.metrics;
        assert_eq!(m.wait_time_community, Some(118.0));
        assert_eq!(m.wait_time_hospital, Some(64.0));
        assert_eq!(m.antipsychotic_use, Some(17.5));
        assert_eq!(m.falls, Some(8.2));
        assert_eq!(m.restraints, None);
        assert_eq!(m.pressure_ulcers, Some(0.8));
        assert_eq!(m.pain, Some(12.3));
        assert_eq!(m.depression, None);
        assert!(!record.is_provincial);
    }

    #[test]
    fn metrics_page_without_name_is_no_data() {
        let err = parse_metrics_page(&fixture("hqo-metrics", "home_without_data.html"), "GHOST HOME")
            .unwrap_err();
        assert_eq!(err.to_string(), "no data on page for GHOST HOME");
    }

    #[test]
    fn detail_url_encodes_home_name() {
        let adapter = HqoMetricsAdapter::new(
            "hqo-metrics",
            "https://www.hqontario.ca/System-Performance/Long-Term-Care-Home-Performance",
            "name",
            "unused.json",
        );
        let url = adapter.detail_url_for("ST. JOSEPH'S VILLA").unwrap();
        assert!(url.starts_with("https://www.hqontario.ca/System-Performance/Long-Term-Care-Home-Performance?name="));
        assert!(url.ends_with("ST.+JOSEPH%27S+VILLA"));
    }

    #[tokio::test]
    async fn metrics_adapter_enumerates_home_list_in_order() {
        let list = workspace_root().join("fixtures/hqo-metrics/ltc-homes-list.json");
        let adapter = HqoMetricsAdapter::new("hqo-metrics", "https://example.test/perf", "name", list);
        let http = HttpFetcher::new(Default::default()).unwrap();

        let homes = adapter.enumerate(&http, &AdapterContext::new()).await.unwrap();
        let names: Vec<_> = homes.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["MAPLE MANOR", "RIVERSIDE LONG-TERM CARE", "ST. JOSEPH'S VILLA"]);
        assert_eq!(homes[0].url, "https://example.test/perf?name=MAPLE+MANOR");
        assert_eq!(adapter.kind(), SourceKind::Metrics);
    }

    #[test]
    fn home_list_from_names_dedupes_and_sorts_upper_case() {
        let at = Utc::now();
        let list = HomeList::from_names(
            ["Riverside Long-Term Care", " maple  manor", "MAPLE MANOR", "", "Maple Manor"],
            at,
            "Public Reporting LTC Homes",
        );
        assert_eq!(list.homes, vec!["MAPLE MANOR", "RIVERSIDE LONG-TERM CARE"]);
        assert_eq!(list.total_homes, Some(2));
        assert_eq!(list.discovered_at, Some(at));
        assert_eq!(list.source.as_deref(), Some("Public Reporting LTC Homes"));
    }

    #[test]
    fn provincial_page_yields_flagged_average_without_hospital_wait() {
        let record = parse_provincial_page(&fixture("hqo-metrics", "provincial.html")).unwrap();
        assert_eq!(record.name, PROVINCIAL_AVERAGE_NAME);
        assert!(record.is_provincial);
        let m = &record.metrics;
        assert_eq!(m.wait_time_community, Some(128.0));
        assert_eq!(m.wait_time_hospital, None);
        assert_eq!(m.antipsychotic_use, Some(19.6));
        assert_eq!(m.falls, Some(16.1));
        assert_eq!(m.restraints, Some(2.4));
        assert_eq!(m.pressure_ulcers, Some(2.9));
        assert_eq!(m.pain, Some(5.1));
        assert_eq!(m.depression, Some(21.2));
    }

    #[test]
    fn provincial_page_without_wait_time_is_no_data() {
        let err = parse_provincial_page(r#"<span id="second-number">19.6%</span>"#).unwrap_err();
        assert_eq!(err.to_string(), "no data on page for Ontario Provincial Average");
    }

    #[tokio::test]
    async fn provincial_average_is_enumerated_first_and_parsed_from_landing_page() {
        let list = workspace_root().join("fixtures/hqo-metrics/ltc-homes-list.json");
        let adapter = HqoMetricsAdapter::new("hqo-metrics", "https://example.test/perf", "name", list)
            .with_provincial_url("https://example.test/perf");
        let http = HttpFetcher::new(Default::default()).unwrap();

        let homes = adapter.enumerate(&http, &AdapterContext::new()).await.unwrap();
        assert_eq!(homes.len(), 4);
        assert_eq!(homes[0].name, "Ontario Provincial Average");
        assert_eq!(homes[0].url, "https://example.test/perf");
        assert_eq!(homes[1].name, "MAPLE MANOR");

        let provincial = adapter
            .parse_detail(&homes[0], &page(fixture("hqo-metrics", "provincial.html")))
            .unwrap();
        assert!(provincial.is_provincial);
        let home = adapter
            .parse_detail(&homes[1], &page(fixture("hqo-metrics", "home.html")))
            .unwrap();
        assert!(!home.is_provincial);
    }

    #[test]
    fn adapter_context_serializes_run_id() {
        let ctx = AdapterContext::new();
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["run_id"], ctx.run_id.to_string());
        let back: AdapterContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);
    }

    #[tokio::test]
    async fn missing_home_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = HqoMetricsAdapter::new(
            "hqo-metrics",
            "https://example.test/perf",
            "name",
            dir.path().join("absent.json"),
        );
        let http = HttpFetcher::new(Default::default()).unwrap();
        assert!(adapter.enumerate(&http, &AdapterContext::new()).await.is_err());
    }
}
