use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use super::pattern::{compile_selector, PatternError};

const REMOVE_QUERY_STRING: &str = "removeQueryString";

/// Listing-page pass that discovers detail links instead of extracting records.
///
/// Built from the rule's ordered fragments:
/// item selector, parent-value selector, href selector, optional
/// `removeQueryString` flag, optional blocklist substring.
#[derive(Debug, Clone)]
pub struct DeepLinkPattern {
    pub item: Selector,
    pub parent_value: Selector,
    pub href: Selector,
    pub remove_query_string: bool,
    pub blocklist: Option<String>,
}

/// A detail link found on a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeepLink {
    pub url: String,
    /// Text carried to the detail page's validations
    pub parent_value: String,
}

impl DeepLinkPattern {
    /// `None` when fewer than three fragments are configured
    pub fn parse(fragments: &[String]) -> Result<Option<Self>, PatternError> {
        if fragments.len() < 3 {
            return Ok(None);
        }

        let remove_query_string = fragments
            .get(3)
            .map(|flag| flag.trim() == REMOVE_QUERY_STRING)
            .unwrap_or(false);
        let blocklist = fragments
            .get(4)
            .map(|keyword| keyword.trim())
            .filter(|keyword| !keyword.is_empty())
            .map(str::to_string);

        Ok(Some(Self {
            item: compile_selector(fragments[0].trim())?,
            parent_value: compile_selector(fragments[1].trim())?,
            href: compile_selector(fragments[2].trim())?,
            remove_query_string,
            blocklist,
        }))
    }

    /// Discover detail links on a page.
    ///
    /// Returns `None` when no element matches the item selector, in which case
    /// the page is handled by regular extraction.
    pub fn discover(&self, document: &Html, page_url: &Url) -> Option<Vec<DeepLink>> {
        let items: Vec<_> = document.select(&self.item).collect();
        if items.is_empty() {
            return None;
        }

        let mut links = Vec::with_capacity(items.len());
        for item in items {
            let parent_value = item
                .select(&self.parent_value)
                .next()
                .map(|element| element.text().collect::<String>().trim().to_string())
                .unwrap_or_default();

            let Some(mut href) = item
                .select(&self.href)
                .next()
                .and_then(|element| element.value().attr("href"))
                .map(|href| href.trim().to_string())
                .filter(|href| !href.is_empty())
            else {
                continue;
            };

            if self.remove_query_string {
                if let Some((path, _)) = href.split_once('?') {
                    href = path.to_string();
                }
            }

            if let Some(keyword) = &self.blocklist {
                if href.contains(keyword.as_str()) {
                    debug!("Not visiting {} because it contains '{}'", href, keyword);
                    continue;
                }
            }

            links.push(DeepLink {
                url: absolutize(&href, page_url),
                parent_value,
            });
        }

        Some(links)
    }
}

/// Resolve a link against the scheme and host of the page it was found on
fn absolutize(href: &str, page_url: &Url) -> String {
    if href.to_lowercase().starts_with("http") {
        return href.to_string();
    }

    let origin = page_url.origin().ascii_serialization();
    if href.starts_with('/') {
        format!("{}{}", origin, href)
    } else {
        format!("{}/{}", origin, href)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(raw: &str) -> Vec<String> {
        raw.split(',').map(str::to_string).collect()
    }

    const LISTING: &str = r#"<html><body>
        <div class="item"><span class="name">Blue</span><a href="/p/1?ref=list">x</a></div>
        <div class="item"><span class="name">Red</span><a href="p/2">y</a></div>
        <div class="item"><span class="name">Ad</span><a href="https://ads.example/p/3">z</a></div>
    </body></html>"#;

    #[test]
    fn test_needs_three_fragments() {
        assert!(DeepLinkPattern::parse(&fragments("div.item,span")).unwrap().is_none());
        assert!(DeepLinkPattern::parse(&[]).unwrap().is_none());
    }

    #[test]
    fn test_discovers_and_normalizes_links() {
        let pattern = DeepLinkPattern::parse(&fragments("div.item,span.name,a,removeQueryString,ads.example"))
            .unwrap()
            .unwrap();
        let page = Url::parse("https://shop.example/list?page=1").unwrap();

        let links = pattern.discover(&Html::parse_document(LISTING), &page).unwrap();

        assert_eq!(
            links,
            vec![
                DeepLink {
                    url: "https://shop.example/p/1".into(),
                    parent_value: "Blue".into()
                },
                DeepLink {
                    url: "https://shop.example/p/2".into(),
                    parent_value: "Red".into()
                },
            ]
        );
    }

    #[test]
    fn test_keeps_query_without_flag() {
        let pattern = DeepLinkPattern::parse(&fragments("div.item,span.name,a")).unwrap().unwrap();
        let page = Url::parse("http://shop.example:8080/list").unwrap();

        let links = pattern.discover(&Html::parse_document(LISTING), &page).unwrap();

        assert_eq!(links.len(), 3);
        assert_eq!(links[0].url, "http://shop.example:8080/p/1?ref=list");
        assert_eq!(links[2].url, "https://ads.example/p/3");
    }

    #[test]
    fn test_detail_page_does_not_fire() {
        let pattern = DeepLinkPattern::parse(&fragments("div.item,span.name,a")).unwrap().unwrap();
        let page = Url::parse("https://shop.example/p/1").unwrap();

        let document = Html::parse_document("<html><body><h1>Product</h1></body></html>");

        assert!(pattern.discover(&document, &page).is_none());
    }
}
