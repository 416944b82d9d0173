//! Loader for the subscription XML file (spec.md §6):
//!
//! ```xml
//! <subscription>
//!   <tracker host="tracker.example" port="9000"/>
//!   <predicate type="prefix" value="movies/"/>
//! </subscription>
//! ```
//!
//! `type` is one of `everything`, `nothing`, `prefix`, or `regex`; `value`
//! is required for `prefix`/`regex` and ignored otherwise. The XML parser
//! itself is out of scope for the node runtime (spec.md §1 names it an
//! external collaborator); this is the minimal reader the CLI needs to
//! exercise a `SinkNode` end to end.

use std::net::{SocketAddr, ToSocketAddrs};

use serde::Deserialize;
use sruth_node::model::Filter;

#[derive(Debug, Deserialize)]
#[serde(rename = "subscription")]
struct SubscriptionXml {
    tracker: TrackerXml,
    predicate: PredicateXml,
}

#[derive(Debug, Deserialize)]
struct TrackerXml {
    #[serde(rename = "@host")]
    host: String,
    #[serde(rename = "@port")]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct PredicateXml {
    #[serde(rename = "@type")]
    kind: String,
    #[serde(rename = "@value", default)]
    value: Option<String>,
}

pub struct Subscription {
    pub tracker: SocketAddr,
    pub filter: Filter,
}

impl Subscription {
    pub fn parse(xml: &str) -> anyhow::Result<Self> {
        let parsed: SubscriptionXml = quick_xml::de::from_str(xml)?;

        let tracker = format!("{}:{}", parsed.tracker.host, parsed.tracker.port)
            .to_socket_addrs()
            .map_err(|e| anyhow::anyhow!("cannot resolve tracker address: {e}"))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("tracker address resolved to no entries"))?;

        let filter = match parsed.predicate.kind.as_str() {
            "everything" => Filter::Everything,
            "nothing" => Filter::Nothing,
            "prefix" => Filter::Prefix(
                parsed
                    .predicate
                    .value
                    .ok_or_else(|| anyhow::anyhow!("predicate type=\"prefix\" requires value"))?,
            ),
            "regex" => Filter::Regex(
                parsed
                    .predicate
                    .value
                    .ok_or_else(|| anyhow::anyhow!("predicate type=\"regex\" requires value"))?,
            ),
            other => anyhow::bail!("unrecognized predicate type {other:?}"),
        };

        Ok(Self { tracker, filter })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefix_predicate() {
        let xml = r#"
            <subscription>
                <tracker host="127.0.0.1" port="9000"/>
                <predicate type="prefix" value="movies/"/>
            </subscription>
        "#;
        let sub = Subscription::parse(xml).unwrap();
        assert_eq!(sub.tracker.port(), 9000);
        assert!(matches!(sub.filter, Filter::Prefix(p) if p == "movies/"));
    }

    #[test]
    fn parses_everything_predicate() {
        let xml = r#"
            <subscription>
                <tracker host="127.0.0.1" port="9000"/>
                <predicate type="everything"/>
            </subscription>
        "#;
        let sub = Subscription::parse(xml).unwrap();
        assert!(matches!(sub.filter, Filter::Everything));
    }

    #[test]
    fn rejects_unknown_predicate_type() {
        let xml = r#"
            <subscription>
                <tracker host="127.0.0.1" port="9000"/>
                <predicate type="bogus"/>
            </subscription>
        "#;
        assert!(Subscription::parse(xml).is_err());
    }

    #[test]
    fn rejects_prefix_predicate_without_value() {
        let xml = r#"
            <subscription>
                <tracker host="127.0.0.1" port="9000"/>
                <predicate type="prefix"/>
            </subscription>
        "#;
        assert!(Subscription::parse(xml).is_err());
    }
}
