//! Parsing of Prometheus text-format scrape bodies.
//!
//! One sample per non-comment line, token-split on ASCII space. Label sets
//! are not interpreted: only a line whose first token equals the bare metric
//! name matches, and the first match wins.

use std::collections::HashMap;

use crate::error::{GatewayError, Result};

/// Parse a sample value.
///
/// Accepts plain decimal, comma-grouped (`23,120,123`) and scientific
/// (`1.5e3`) notation.
pub fn parse_number(raw: &str) -> Result<f64> {
    let cleaned = raw.replace(',', "");
    cleaned
        .parse::<f64>()
        .map_err(|_| GatewayError::BadResponse(format!("unparsable sample value {raw:?}")))
}

/// Find the first sample for `name` in a scrape body.
///
/// Comment lines start with `#`. An absent metric yields `None`, a present
/// metric with a malformed value yields an error.
pub fn find_sample(body: &str, name: &str) -> Result<Option<f64>> {
    for line in body.lines() {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let Some(first) = tokens.next() else {
            continue;
        };
        if first.starts_with('#') {
            continue;
        }
        if first == name {
            let Some(value) = tokens.next() else {
                return Err(GatewayError::BadResponse(format!(
                    "sample line for {name:?} carries no value"
                )));
            };
            return parse_number(value).map(Some);
        }
    }
    Ok(None)
}

/// Extract every requested metric from a scrape body.
///
/// Unknown names yield no entry; malformed values are skipped so one bad
/// line does not drop the whole scrape.
pub fn extract(body: &str, names: &[String]) -> HashMap<String, f64> {
    let mut samples = HashMap::with_capacity(names.len());
    for name in names {
        match find_sample(body, name) {
            Ok(Some(value)) => {
                samples.insert(name.clone(), value);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(metric = %name, error = %err, "dropping unparsable scrape sample");
            }
        }
    }
    samples
}
