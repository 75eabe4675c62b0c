use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::Result;
use quick_xml::events::Event;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{info, warn};
use url::Url;

use crate::fetcher::HttpFetcher;

static ANCHORS: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Collect candidate article URLs from index pages, sitemaps and feeds.
/// A source that fails to load or parse is logged and skipped.
pub async fn discover(
    fetcher: &HttpFetcher,
    sources: &[String],
    link_pattern: Option<&Regex>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for source in sources {
        info!("Fetching source: {}", source);
        let body = match fetcher.get_body(source).await {
            Ok(body) => body,
            Err(e) => {
                warn!(source = %source, error = %e, "source unavailable");
                continue;
            }
        };
        let links = match extract_links(source, &body) {
            Ok(links) => links,
            Err(e) => {
                warn!(source = %source, error = %e, "could not parse source");
                continue;
            }
        };
        let before = found.len();
        for link in links {
            if link_pattern.map_or(true, |re| re.is_match(&link)) && seen.insert(link.clone()) {
                found.push(link);
            }
        }
        info!("{} candidate urls from {}", found.len() - before, source);
    }
    found
}

/// Links of one source body: feed/sitemap entries if it is XML, anchors otherwise.
pub fn extract_links(source: &str, body: &str) -> Result<Vec<String>> {
    if looks_like_xml(body) {
        let links = parse_feed(body)?;
        if !links.is_empty() {
            return Ok(links);
        }
    }
    let base = Url::parse(source)?;
    Ok(html_links(&base, body))
}

fn looks_like_xml(body: &str) -> bool {
    let head = body.trim_start();
    ["<?xml", "<urlset", "<rss", "<feed"]
        .iter()
        .any(|p| head.starts_with(p))
}

/// `<url><loc>` (sitemap), `<item><link>` (RSS) and `<entry><link href>` (Atom).
fn parse_feed(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    let mut urls = Vec::new();
    let mut in_entry = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"url" | b"item" | b"entry" => in_entry = true,
                b"loc" | b"link" if in_entry => in_loc = true,
                _ => {}
            },
            Ok(Event::Empty(e)) if in_entry && e.local_name().as_ref() == b"link" => {
                if let Some(href) = e.try_get_attribute("href")? {
                    push_trimmed(&mut urls, &href.unescape_value()?);
                }
            }
            Ok(Event::Text(e)) if in_loc => push_trimmed(&mut urls, &e.unescape()?),
            Ok(Event::CData(e)) if in_loc => {
                push_trimmed(&mut urls, &String::from_utf8_lossy(&e.into_inner()))
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"loc" | b"link" => in_loc = false,
                b"url" | b"item" | b"entry" => in_entry = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.into()),
            _ => {}
        }
        buf.clear();
    }
    Ok(urls)
}

fn push_trimmed(urls: &mut Vec<String>, raw: &str) {
    let url = raw.trim();
    if !url.is_empty() {
        urls.push(url.to_string());
    }
}

fn html_links(base: &Url, html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHORS)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.to_string())
        .collect()
}
