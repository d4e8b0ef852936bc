//! Paging Helper (§4.12). Splits an oversized command result at line
//! boundaries into pages of at most `page_size_chars`, addressable by
//! `page_id = "{request_id}:page:{k}"`.

#[derive(Debug, Clone)]
pub struct PagedResult {
    pub first_page: String,
    pub next_page_id: Option<String>,
    pub pages: Vec<String>,
}

/// Split `text` into pages no larger than `page_size_chars`, breaking only
/// at line boundaries so a page never cuts a line in half (unless a
/// single line alone exceeds the page size, in which case it is emitted
/// whole as its own page).
pub fn paginate(request_id: &str, text: &str, page_size_chars: usize) -> PagedResult {
    let mut pages = Vec::new();
    let mut current = String::new();

    for line in text.split_inclusive('\n') {
        if !current.is_empty() && current.len() + line.len() > page_size_chars {
            pages.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        pages.push(current);
    }
    if pages.is_empty() {
        pages.push(String::new());
    }

    let first_page = pages[0].clone();
    let next_page_id = if pages.len() > 1 {
        Some(page_id(request_id, 2))
    } else {
        None
    };

    PagedResult {
        first_page,
        next_page_id,
        pages,
    }
}

pub fn page_id(request_id: &str, page_number: usize) -> String {
    format!("{request_id}:page:{page_number}")
}

/// Parse a page id back into its `(request_id, page_number)` parts.
pub fn parse_page_id(page_id: &str) -> Option<(String, usize)> {
    let mut parts = page_id.rsplitn(3, ':');
    let number: usize = parts.next()?.parse().ok()?;
    let marker = parts.next()?;
    if marker != "page" {
        return None;
    }
    let request_id = parts.next()?.to_string();
    Some((request_id, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_result_is_single_page() {
        let result = paginate("r1", "line one\nline two\n", 3500);
        assert_eq!(result.pages.len(), 1);
        assert!(result.next_page_id.is_none());
    }

    #[test]
    fn long_result_splits_at_line_boundaries() {
        let text = "a".repeat(10).to_string() + "\n" + &"b".repeat(10) + "\n" + &"c".repeat(10);
        let result = paginate("r1", &text, 15);
        assert!(result.pages.len() >= 2);
        assert!(result.pages.iter().all(|p| !p.is_empty()));
        assert_eq!(result.next_page_id, Some("r1:page:2".to_string()));
    }

    #[test]
    fn page_id_round_trips() {
        let id = page_id("r1", 3);
        assert_eq!(parse_page_id(&id), Some(("r1".to_string(), 3)));
    }

    #[test]
    fn oversized_single_line_is_its_own_page() {
        let text = "x".repeat(100);
        let result = paginate("r1", &text, 10);
        assert_eq!(result.pages.len(), 1);
        assert_eq!(result.pages[0].len(), 100);
    }
}
