//! XEP-0313 query parsing, paging and result building.
//!
//! A query looks like:
//!
//! ```xml
//! <iq type='set' id='juliet1'>
//!   <query xmlns='urn:xmpp:mam:2' queryid='f27'>
//!     <x xmlns='jabber:x:data' type='submit'>
//!       <field var='FORM_TYPE' type='hidden'><value>urn:xmpp:mam:2</value></field>
//!       <field var='with'><value>juliet@capulet.lit</value></field>
//!     </x>
//!     <set xmlns='http://jabber.org/protocol/rsm'>
//!       <max>10</max>
//!       <after>28482-98726-73623</after>
//!     </set>
//!   </query>
//! </iq>
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use minidom::Element;
use uuid::Uuid;

use crate::parser::ns;
use crate::stanza::Stanza;
use crate::storage::{ArchiveFilters, ArchiveMessage, ArchiveMetadata};
use crate::XmppError;

/// Page size when the client sends no `<max/>`.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Upper bound on `<max/>`.
pub const MAX_PAGE_SIZE: usize = 500;

/// Result-set-management request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Page size
    pub max: Option<usize>,
    /// Absolute offset of the first item
    pub index: Option<usize>,
    /// Items after this id
    pub after: Option<String>,
    /// Items before this id; empty string requests the last page
    pub before: Option<String>,
}

/// A parsed archive query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveQuery {
    /// Client correlation id echoed in every result
    pub query_id: Option<String>,
    /// Data form filters
    pub filters: ArchiveFilters,
    /// Paging
    pub page: PageRequest,
    /// Return the page newest first
    pub flip_page: bool,
}

impl ArchiveQuery {
    /// Parse a `<query xmlns='urn:xmpp:mam:2'/>` element.
    pub fn from_element(query: &Element) -> Result<Self, XmppError> {
        let mut parsed = ArchiveQuery {
            query_id: query.attr("queryid").map(str::to_string),
            flip_page: query.has_child("flip-page", ns::MAM),
            ..Default::default()
        };
        if let Some(form) = query.get_child("x", ns::XDATA) {
            parse_form(form, &mut parsed.filters)?;
        }
        if let Some(set) = query.get_child("set", ns::RSM) {
            parsed.page = parse_rsm(set)?;
        }
        Ok(parsed)
    }
}

fn field_values(field: &Element) -> Vec<String> {
    field
        .children()
        .filter(|c| c.name() == "value")
        .map(|v| v.text())
        .collect()
}

fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, XmppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| XmppError::bad_request(Some(format!("invalid datetime {}: {}", raw, e))))
}

fn parse_form(form: &Element, filters: &mut ArchiveFilters) -> Result<(), XmppError> {
    for field in form.children().filter(|c| c.name() == "field") {
        let values = field_values(field);
        let first = values.first().filter(|v| !v.is_empty()).cloned();
        match field.attr("var").unwrap_or_default() {
            "FORM_TYPE" => {
                if first.as_deref().is_some_and(|v| v != ns::MAM) {
                    return Err(XmppError::bad_request(Some("unexpected FORM_TYPE".into())));
                }
            }
            "with" => filters.with = first,
            "start" => filters.start = first.as_deref().map(parse_datetime).transpose()?,
            "end" => filters.end = first.as_deref().map(parse_datetime).transpose()?,
            "before-id" => filters.before_id = first,
            "after-id" => filters.after_id = first,
            "ids" => filters.ids = values.into_iter().filter(|v| !v.is_empty()).collect(),
            _ => {}
        }
    }
    Ok(())
}

fn parse_rsm(set: &Element) -> Result<PageRequest, XmppError> {
    let mut page = PageRequest::default();
    for child in set.children() {
        let text = child.text();
        match child.name() {
            "max" => {
                let max = text
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| XmppError::bad_request(Some("invalid max".into())))?;
                page.max = Some(max);
            }
            "index" => {
                let index = text
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| XmppError::bad_request(Some("invalid index".into())))?;
                page.index = Some(index);
            }
            "after" if !text.is_empty() => page.after = Some(text),
            "before" => page.before = Some(text),
            _ => {}
        }
    }
    Ok(page)
}

/// A page of archived messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Messages in archive order
    pub messages: Vec<ArchiveMessage>,
    /// Offset of the first message within the filtered result
    pub first_index: usize,
    /// Size of the filtered result
    pub count: usize,
    /// Whether the page reaches the end of the result in paging direction
    pub complete: bool,
}

/// Cut the page `request` asks for out of `messages`.
pub fn paginate(messages: Vec<ArchiveMessage>, request: &PageRequest) -> Result<Page, XmppError> {
    let count = messages.len();
    let max = request.max.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let position = |id: &str| {
        messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| XmppError::item_not_found(Some(format!("archive id {}", id))))
    };

    let (start, end, complete) = if let Some(ref after) = request.after {
        let start = position(after)? + 1;
        let end = (start + max).min(count);
        (start, end, end == count)
    } else if let Some(ref before) = request.before {
        let end = if before.is_empty() { count } else { position(before)? };
        let start = end.saturating_sub(max);
        (start, end, start == 0)
    } else if let Some(index) = request.index {
        if index > count {
            return Err(XmppError::item_not_found(Some(format!("index {} out of range", index))));
        }
        let end = (index + max).min(count);
        (index, end, end == count)
    } else {
        let end = max.min(count);
        (0, end, end == count)
    };

    Ok(Page {
        messages: messages.into_iter().skip(start).take(end - start).collect(),
        first_index: start,
        count,
        complete,
    })
}

/// `<message><result><forwarded/></result></message>` for one entry.
pub fn result_message(message: &ArchiveMessage, query_id: Option<&str>, owner: jid::BareJid, to: jid::Jid) -> Stanza {
    let forwarded = Element::builder("forwarded", ns::FORWARD)
        .append(
            Element::builder("delay", ns::DELAY)
                .attr("stamp", message.stamp.to_rfc3339_opts(SecondsFormat::Millis, true))
                .build(),
        )
        .append(message.message.element().clone())
        .build();
    let mut result = Element::builder("result", ns::MAM)
        .attr("id", message.id.as_str())
        .append(forwarded)
        .build();
    if let Some(query_id) = query_id {
        result.set_attr("queryid", query_id);
    }
    Stanza::message(None)
        .with_attr("id", &Uuid::new_v4().to_string())
        .with_from(owner)
        .with_to(to)
        .with_child(result)
}

/// `<fin/>` closing a query.
pub fn fin_element(page: &Page) -> Element {
    let mut set = Element::builder("set", ns::RSM).build();
    if let (Some(first), Some(last)) = (page.messages.first(), page.messages.last()) {
        set.append_child(
            Element::builder("first", ns::RSM)
                .attr("index", page.first_index.to_string())
                .append(first.id.clone())
                .build(),
        );
        set.append_child(
            Element::builder("last", ns::RSM)
                .append(last.id.clone())
                .build(),
        );
    }
    set.append_child(
        Element::builder("count", ns::RSM)
            .append(page.count.to_string())
            .build(),
    );
    Element::builder("fin", ns::MAM)
        .attr("complete", if page.complete { "true" } else { "false" })
        .append(set)
        .build()
}

/// The search form advertised by a `get` query.
pub fn form_element() -> Element {
    let field = |var: &str, field_type: &str| {
        Element::builder("field", ns::XDATA)
            .attr("var", var)
            .attr("type", field_type)
            .build()
    };
    let form_type = Element::builder("field", ns::XDATA)
        .attr("var", "FORM_TYPE")
        .attr("type", "hidden")
        .append(
            Element::builder("value", ns::XDATA)
                .append(ns::MAM.to_string())
                .build(),
        )
        .build();
    let form = Element::builder("x", ns::XDATA)
        .attr("type", "form")
        .append(form_type)
        .append(field("with", "jid-single"))
        .append(field("start", "text-single"))
        .append(field("end", "text-single"))
        .append(field("before-id", "text-single"))
        .append(field("after-id", "text-single"))
        .append(field("ids", "text-multi"))
        .build();
    Element::builder("query", ns::MAM).append(form).build()
}

/// `<metadata/>` describing the archive bounds.
pub fn metadata_element(metadata: Option<&ArchiveMetadata>) -> Element {
    let mut element = Element::builder("metadata", ns::MAM).build();
    if let Some(m) = metadata {
        let bound = |name: &str, id: &str, stamp: &DateTime<Utc>| {
            Element::builder(name, ns::MAM)
                .attr("id", id)
                .attr("timestamp", stamp.to_rfc3339_opts(SecondsFormat::Secs, true))
                .build()
        };
        element.append_child(bound("start", &m.start_id, &m.start_timestamp));
        element.append_child(bound("end", &m.end_id, &m.end_timestamp));
    }
    element
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use chrono::TimeZone;

    fn archived(n: usize) -> Vec<ArchiveMessage> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| ArchiveMessage {
                archive_id: "ortuman".into(),
                id: format!("id{}", i),
                from: "noelia@localhost/hall".into(),
                to: "ortuman@localhost".into(),
                message: Stanza::message(Some("chat")),
                stamp: base + chrono::Duration::seconds(i as i64),
            })
            .collect()
    }

    fn ids(page: &Page) -> Vec<&str> {
        page.messages.iter().map(|m| m.id.as_str()).collect()
    }

    fn value_field(var: &str, values: &[&str]) -> Element {
        let mut field = Element::builder("field", ns::XDATA).attr("var", var).build();
        for value in values {
            field.append_child(
                Element::builder("value", ns::XDATA)
                    .append(value.to_string())
                    .build(),
            );
        }
        field
    }

    #[test]
    fn test_parse_query() {
        let form = Element::builder("x", ns::XDATA)
            .attr("type", "submit")
            .append(value_field("FORM_TYPE", &[ns::MAM]))
            .append(value_field("with", &["noelia@localhost"]))
            .append(value_field("start", &["2024-01-01T00:00:00Z"]))
            .append(value_field("ids", &["a", "b"]))
            .build();
        let set = Element::builder("set", ns::RSM)
            .append(Element::builder("max", ns::RSM).append("10".to_string()).build())
            .append(Element::builder("before", ns::RSM).build())
            .build();
        let query = Element::builder("query", ns::MAM)
            .attr("queryid", "f27")
            .append(form)
            .append(set)
            .append(Element::builder("flip-page", ns::MAM).build())
            .build();

        let parsed = ArchiveQuery::from_element(&query).unwrap();
        assert_eq!(parsed.query_id.as_deref(), Some("f27"));
        assert_eq!(parsed.filters.with.as_deref(), Some("noelia@localhost"));
        assert!(parsed.filters.start.is_some());
        assert_eq!(parsed.filters.ids, vec!["a", "b"]);
        assert_eq!(parsed.page.max, Some(10));
        assert_eq!(parsed.page.before.as_deref(), Some(""));
        assert!(parsed.flip_page);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        let bad_date = Element::builder("query", ns::MAM)
            .append(
                Element::builder("x", ns::XDATA)
                    .append(value_field("start", &["yesterday"]))
                    .build(),
            )
            .build();
        assert!(ArchiveQuery::from_element(&bad_date).is_err());

        let bad_max = Element::builder("query", ns::MAM)
            .append(
                Element::builder("set", ns::RSM)
                    .append(Element::builder("max", ns::RSM).append("many".to_string()).build())
                    .build(),
            )
            .build();
        assert!(ArchiveQuery::from_element(&bad_max).is_err());
    }

    #[test]
    fn test_paginate_forward() {
        let page = paginate(archived(5), &PageRequest { max: Some(2), ..Default::default() }).unwrap();
        assert_eq!(ids(&page), vec!["id0", "id1"]);
        assert!(!page.complete);
        assert_eq!(page.count, 5);

        let page = paginate(
            archived(5),
            &PageRequest {
                max: Some(2),
                after: Some("id3".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ids(&page), vec!["id4"]);
        assert_eq!(page.first_index, 4);
        assert!(page.complete);
    }

    #[test]
    fn test_paginate_last_page_and_before() {
        let last = PageRequest {
            max: Some(2),
            before: Some(String::new()),
            ..Default::default()
        };
        let page = paginate(archived(5), &last).unwrap();
        assert_eq!(ids(&page), vec!["id3", "id4"]);
        assert!(!page.complete);

        let before = PageRequest {
            max: Some(2),
            before: Some("id1".into()),
            ..Default::default()
        };
        let page = paginate(archived(5), &before).unwrap();
        assert_eq!(ids(&page), vec!["id0"]);
        assert!(page.complete);
    }

    #[test]
    fn test_paginate_index_and_errors() {
        let page = paginate(
            archived(5),
            &PageRequest {
                max: Some(2),
                index: Some(2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(ids(&page), vec!["id2", "id3"]);

        let err = paginate(
            archived(5),
            &PageRequest {
                index: Some(6),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.stanza_condition(), StanzaErrorCondition::ItemNotFound);

        let err = paginate(
            archived(5),
            &PageRequest {
                after: Some("missing".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.stanza_condition(), StanzaErrorCondition::ItemNotFound);
    }

    #[test]
    fn test_page_size_is_capped() {
        let page = paginate(
            archived(MAX_PAGE_SIZE + 10),
            &PageRequest {
                max: Some(MAX_PAGE_SIZE * 2),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.messages.len(), MAX_PAGE_SIZE);
        assert_eq!(page.messages[0].id, "id0");
        assert!(!page.complete);
    }

    #[test]
    fn test_fin_element() {
        let page = paginate(archived(3), &PageRequest::default()).unwrap();
        let fin = fin_element(&page);
        assert_eq!(fin.attr("complete"), Some("true"));
        let set = fin.get_child("set", ns::RSM).unwrap();
        assert_eq!(set.get_child("first", ns::RSM).unwrap().text(), "id0");
        assert_eq!(set.get_child("last", ns::RSM).unwrap().text(), "id2");
        assert_eq!(set.get_child("count", ns::RSM).unwrap().text(), "3");

        let empty = paginate(Vec::new(), &PageRequest::default()).unwrap();
        let fin = fin_element(&empty);
        assert!(fin.get_child("set", ns::RSM).unwrap().get_child("first", ns::RSM).is_none());
    }
}
