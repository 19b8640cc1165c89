use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::GatewayConfig;
use crate::http_client::HttpRequest;
use crate::identifier::{Identifier, IdentifierBatch, IdentifierKind, OutputField};
use crate::search::{CacheKey, ExportSpec, SearchQuery, SearchSession};

use super::{
    IdentityMatch, JobPollReport, RemoteJobId, RequestBuilder, ResponseParser, ResultLocation,
    ViewKind,
};

const PCT_DOCTYPE: &str = "<?xml version=\"1.0\"?>\n<!DOCTYPE PCT-Data PUBLIC \"-//NCBI//NCBI PCTools/EN\" \"NCBI_PCTools.dtd\">\n";

/// Status values after which a job will never produce a download.
const TERMINAL_STATUSES: [&str; 6] = [
    "server-error",
    "input-error",
    "data-error",
    "stopped",
    "hit-limit",
    "time-limit",
];

const CAS_LINK_PREFIX: &str = "https://commonchemistry.cas.org/detail?cas_rn=";
const VENDOR_CATEGORY: &str = "Chemical Vendors";
const IDENTITY_PROPERTIES: &str = "InChI,CanonicalSMILES,IUPACName";

/// PubChem PUG, PUG REST, PUG View, SDQ and NCBI E-utilities encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubChemProtocol {
    pubchem_base_url: String,
    eutils_base_url: String,
    identity_type: String,
    timeout_ms: u64,
}

impl Default for PubChemProtocol {
    fn default() -> Self {
        Self::new(&GatewayConfig::default())
    }
}

impl PubChemProtocol {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            pubchem_base_url: config.pubchem_base_url.trim_end_matches('/').to_owned(),
            eutils_base_url: config.eutils_base_url.trim_end_matches('/').to_owned(),
            identity_type: config.identity_type.clone(),
            timeout_ms: config.request_timeout_ms,
        }
    }

    fn pug_endpoint(&self) -> String {
        format!("{}/pug/pug.cgi", self.pubchem_base_url)
    }

    fn pug_post(&self, xml: String) -> HttpRequest {
        HttpRequest::post(self.pug_endpoint())
            .with_header("content-type", "text/xml")
            .with_body(xml)
            .with_timeout_ms(self.timeout_ms)
    }

    fn get(&self, url: String) -> HttpRequest {
        HttpRequest::get(url).with_timeout_ms(self.timeout_ms)
    }
}

impl RequestBuilder for PubChemProtocol {
    fn search(&self, query: &SearchQuery) -> HttpRequest {
        self.get(format!(
            "{}/esearch.fcgi?db=pccompound&term={}&retstart=0&retmax=0&retmode=json&usehistory=y",
            self.eutils_base_url,
            urlencoding::encode(query.term())
        ))
    }

    fn cache_key_request(&self, session: &SearchSession) -> HttpRequest {
        self.get(format!(
            "{}/list_gateway/list_gateway.cgi?action=entrez_to_cache&entrez_db=pccompound&entrez_query_key={}&entrez_webenv={}",
            self.pubchem_base_url,
            urlencoding::encode(session.query_key()),
            urlencoding::encode(session.environment_token())
        ))
    }

    fn export(&self, key: &CacheKey, spec: &ExportSpec) -> HttpRequest {
        let query = json!({
            "download": spec.field_list(),
            "collection": "compound",
            "where": {
                "ands": [
                    {"input": {"type": "netcachekey", "idtype": "cid", "key": key.as_str()}}
                ]
            },
            "order": ["relevancescore,desc"],
            "start": 1,
            "limit": spec.row_limit(),
            "downloadfilename": "PubChem_compound"
        });
        self.get(format!(
            "{}/sdq/sdqagent.cgi?infmt=json&outfmt=csv&query={}",
            self.pubchem_base_url,
            urlencoding::encode(&query.to_string())
        ))
    }

    fn exchange(&self, batch: &IdentifierBatch, output: OutputField) -> HttpRequest {
        self.pug_post(exchange_xml(batch, output))
    }

    fn status_request(&self, job_id: &RemoteJobId) -> HttpRequest {
        let xml = format!(
            "{PCT_DOCTYPE}<PCT-Data>\n<PCT-Data_input>\n<PCT-InputData>\n<PCT-InputData_request>\n<PCT-Request>\n<PCT-Request_reqid>{}</PCT-Request_reqid>\n<PCT-Request_type value=\"status\"/>\n</PCT-Request>\n</PCT-InputData_request>\n</PCT-InputData>\n</PCT-Data_input>\n</PCT-Data>",
            escape_xml(job_id.as_str())
        );
        self.pug_post(xml)
    }

    fn download(&self, location: &ResultLocation) -> HttpRequest {
        // The FTP host also serves results over HTTPS.
        let url = match location.as_str().strip_prefix("ftp://") {
            Some(rest) => format!("https://{rest}"),
            None => location.as_str().to_owned(),
        };
        self.get(url)
    }

    fn fast_identity(&self, identifier: &Identifier) -> HttpRequest {
        let base = format!("{}/rest/pug/compound/fastidentity", self.pubchem_base_url);
        let tail = format!(
            "property/{IDENTITY_PROPERTIES}/json?identity_type={}",
            urlencoding::encode(&self.identity_type)
        );
        match identifier.kind() {
            IdentifierKind::Cid => {
                self.get(format!("{base}/cid/{}/{tail}", identifier.value()))
            }
            // Structural strings may contain '/' so they travel in the body.
            kind => HttpRequest::post(format!("{base}/{}/{tail}", kind.as_str()))
                .with_form(&[(kind.as_str(), identifier.value())])
                .with_timeout_ms(self.timeout_ms),
        }
    }

    fn compound_view(&self, cid: u64, kind: ViewKind) -> HttpRequest {
        let url = match kind {
            ViewKind::Cas => format!(
                "{}/rest/pug_view/data/compound/{cid}/JSON?heading=CAS",
                self.pubchem_base_url
            ),
            ViewKind::Categories => format!(
                "{}/rest/pug_view/categories/compound/{cid}/JSON",
                self.pubchem_base_url
            ),
        };
        self.get(url)
    }
}

impl ResponseParser for PubChemProtocol {
    fn job_id(&self, body: &str) -> Option<RemoteJobId> {
        between(body, "<PCT-Waiting_reqid>", "</PCT-Waiting_reqid>").map(RemoteJobId::new)
    }

    fn job_status(&self, body: &str) -> JobPollReport {
        if let Some(url) = between(body, "<PCT-Download-URL_url>", "</PCT-Download-URL_url>") {
            return JobPollReport::Ready(ResultLocation::new(url));
        }
        match between(body, "<PCT-Status value=\"", "\"") {
            Some(status) if TERMINAL_STATUSES.contains(&status) => {
                let message = between(
                    body,
                    "<PCT-Status-Message_message>",
                    "</PCT-Status-Message_message>",
                )
                .unwrap_or(status);
                JobPollReport::Failed(message.to_owned())
            }
            _ => JobPollReport::Pending,
        }
    }

    fn search_session(&self, body: &str) -> Option<SearchSession> {
        let envelope: ESearchEnvelope = serde_json::from_str(body).ok()?;
        let result = envelope.esearchresult;
        let query_key = result.querykey.filter(|key| !key.is_empty())?;
        let webenv = result.webenv.filter(|env| !env.is_empty())?;
        let count = result
            .count
            .and_then(|count| count.trim().parse::<u64>().ok())
            .unwrap_or(0);
        Some(SearchSession::new(query_key, webenv, count))
    }

    fn cache_key(&self, body: &str) -> Option<CacheKey> {
        between(body, "<Response_cache-key>", "</Response_cache-key>").map(CacheKey::new)
    }

    fn identity_matches(&self, body: &str) -> Result<Vec<IdentityMatch>, String> {
        let envelope: PropertyEnvelope =
            serde_json::from_str(body).map_err(|error| format!("unreadable response: {error}"))?;
        if let Some(fault) = envelope.fault {
            return Err(fault.message.unwrap_or(fault.code));
        }
        let table = envelope
            .property_table
            .ok_or_else(|| String::from("response has no property table"))?;
        Ok(table
            .properties
            .into_iter()
            .map(|row| IdentityMatch {
                cid: row.cid,
                smiles: row.smiles,
                inchi: row.inchi,
                iupac: row.iupac_name,
            })
            .collect())
    }

    fn cas_number(&self, body: &str) -> Option<String> {
        let document: Value = serde_json::from_str(body).ok()?;
        find_string_leaf(&document, &|leaf| {
            leaf.strip_prefix(CAS_LINK_PREFIX)
                .filter(|rn| !rn.is_empty())
                .map(str::to_owned)
        })
    }

    fn vendor_links(&self, body: &str, vendors: &[String]) -> BTreeMap<String, String> {
        let Ok(document) = serde_json::from_str::<CategoriesEnvelope>(body) else {
            return BTreeMap::new();
        };
        let mut vendor_categories = document
            .source_categories
            .categories
            .into_iter()
            .filter(|category| category.category == VENDOR_CATEGORY);
        let (Some(category), None) = (vendor_categories.next(), vendor_categories.next()) else {
            return BTreeMap::new();
        };
        category
            .sources
            .into_iter()
            .filter(|source| vendors.iter().any(|vendor| vendor == &source.source_name))
            .filter_map(|source| Some((source.source_name, source.source_record_url?)))
            .collect()
    }
}

fn exchange_xml(batch: &IdentifierBatch, output: OutputField) -> String {
    let mut uids = String::new();
    match batch.kind() {
        IdentifierKind::Smiles => {
            uids.push_str("<PCT-QueryUids_smiles>\n");
            for value in batch.values() {
                uids.push_str(&format!(
                    "<PCT-QueryUids_smiles_E>{}</PCT-QueryUids_smiles_E>\n",
                    escape_xml(value)
                ));
            }
            uids.push_str("</PCT-QueryUids_smiles>\n");
        }
        IdentifierKind::Cid => {
            uids.push_str("<PCT-QueryUids_ids>\n<PCT-ID-List>\n<PCT-ID-List_db>pccompound</PCT-ID-List_db>\n<PCT-ID-List_uids>\n");
            for value in batch.values() {
                uids.push_str(&format!("<PCT-ID-List_uids_E>{value}</PCT-ID-List_uids_E>\n"));
            }
            uids.push_str("</PCT-ID-List_uids>\n</PCT-ID-List>\n</PCT-QueryUids_ids>\n");
        }
        IdentifierKind::Inchi => {
            uids.push_str("<PCT-QueryUids_inchis>\n");
            for value in batch.values() {
                uids.push_str(&format!(
                    "<PCT-QueryUids_inchis_E>{}</PCT-QueryUids_inchis_E>\n",
                    escape_xml(value)
                ));
            }
            uids.push_str("</PCT-QueryUids_inchis>\n");
        }
    }

    format!(
        "{PCT_DOCTYPE}<PCT-Data>\n<PCT-Data_input>\n<PCT-InputData>\n<PCT-InputData_query>\n<PCT-Query>\n<PCT-Query_type>\n<PCT-QueryType>\n<PCT-QueryType_id-exchange>\n<PCT-QueryIDExchange>\n<PCT-QueryIDExchange_input>\n<PCT-QueryUids>\n{uids}</PCT-QueryUids>\n</PCT-QueryIDExchange_input>\n<PCT-QueryIDExchange_operation-type value=\"same\"/>\n<PCT-QueryIDExchange_output-type value=\"{}\"/>\n<PCT-QueryIDExchange_output-method value=\"file-pair\"/>\n<PCT-QueryIDExchange_compression value=\"none\"/>\n</PCT-QueryIDExchange>\n</PCT-QueryType_id-exchange>\n</PCT-QueryType>\n</PCT-Query_type>\n</PCT-Query>\n</PCT-InputData_query>\n</PCT-InputData>\n</PCT-Data_input>\n</PCT-Data>",
        output.as_str()
    )
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Trimmed, non-empty text between the first `start` and the next `end`.
fn between<'a>(body: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = body.find(start)? + start.len();
    let len = body[from..].find(end)?;
    let inner = body[from..from + len].trim();
    (!inner.is_empty()).then_some(inner)
}

fn find_string_leaf<F>(value: &Value, matcher: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(leaf) => matcher(leaf),
        Value::Array(items) => items.iter().find_map(|item| find_string_leaf(item, matcher)),
        Value::Object(map) => map.values().find_map(|item| find_string_leaf(item, matcher)),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ESearchEnvelope {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    count: Option<String>,
    querykey: Option<String>,
    webenv: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PropertyEnvelope {
    #[serde(rename = "PropertyTable")]
    property_table: Option<PropertyTable>,
    #[serde(rename = "Fault")]
    fault: Option<Fault>,
}

#[derive(Debug, Deserialize)]
struct PropertyTable {
    #[serde(rename = "Properties", default)]
    properties: Vec<PropertyRow>,
}

#[derive(Debug, Deserialize)]
struct PropertyRow {
    #[serde(rename = "CID")]
    cid: u64,
    #[serde(rename = "InChI")]
    inchi: Option<String>,
    #[serde(rename = "CanonicalSMILES", alias = "ConnectivitySMILES", alias = "SMILES")]
    smiles: Option<String>,
    #[serde(rename = "IUPACName")]
    iupac_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Fault {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoriesEnvelope {
    #[serde(rename = "SourceCategories")]
    source_categories: SourceCategories,
}

#[derive(Debug, Deserialize)]
struct SourceCategories {
    #[serde(rename = "Categories", default)]
    categories: Vec<SourceCategory>,
}

#[derive(Debug, Deserialize)]
struct SourceCategory {
    #[serde(rename = "Category")]
    category: String,
    #[serde(rename = "Sources", default)]
    sources: Vec<CategorySource>,
}

#[derive(Debug, Deserialize)]
struct CategorySource {
    #[serde(rename = "SourceName")]
    source_name: String,
    #[serde(rename = "SourceRecordURL")]
    source_record_url: Option<String>,
}
