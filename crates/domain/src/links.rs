//! 条目描述中的云盘链接检测

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static LINK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)https?://drive\.google\.com/(?:a/[^/\s]+/)?file/d/([a-zA-Z0-9_-]+)(?:/[a-zA-Z]*)?(?:\?[^&\s]*)?",
        r"(?i)https?://drive\.google\.com/open\?id=([a-zA-Z0-9_-]+)",
        r"(?i)https?://docs\.google\.com/document/d/([a-zA-Z0-9_-]+)",
        r"(?i)https?://docs\.google\.com/spreadsheets/d/([a-zA-Z0-9_-]+)",
        r"(?i)https?://docs\.google\.com/presentation/d/([a-zA-Z0-9_-]+)",
        r"(?i)https?://drive\.google\.com/drive/folders/([a-zA-Z0-9_-]+)",
        r"(?i)https?://drive\.google\.com/uc\?(?:[^\s&]+&)*id=([a-zA-Z0-9_-]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// 链接类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    File,
    Document,
    Spreadsheet,
    Presentation,
    Folder,
}

impl LinkKind {
    fn from_url(url: &str) -> Self {
        let url = url.to_lowercase();
        if url.contains("docs.google.com/document") {
            LinkKind::Document
        } else if url.contains("docs.google.com/spreadsheets") {
            LinkKind::Spreadsheet
        } else if url.contains("docs.google.com/presentation") {
            LinkKind::Presentation
        } else if url.contains("drive.google.com/drive/folders") {
            LinkKind::Folder
        } else {
            LinkKind::File
        }
    }
}

/// 检测到的链接
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub file_id: String,
    pub url: String,
    pub kind: LinkKind,
    /// 仅普通文件有直接下载地址
    pub download_url: Option<String>,
}

/// 检测文本中的云盘链接，按文件ID去重
pub fn detect_links(text: &str) -> Vec<Link> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for pattern in LINK_PATTERNS.iter() {
        for captures in pattern.captures_iter(text) {
            let (Some(whole), Some(file_id)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            if !seen.insert(file_id.as_str().to_string()) {
                continue;
            }
            let kind = LinkKind::from_url(whole.as_str());
            let download_url = (kind == LinkKind::File).then(|| {
                format!(
                    "https://drive.google.com/uc?export=download&id={}",
                    file_id.as_str()
                )
            });
            links.push(Link {
                file_id: file_id.as_str().to_string(),
                url: whole.as_str().to_string(),
                kind,
                download_url,
            });
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_file_and_document_links() {
        let text = "资料: https://drive.google.com/file/d/1AbC_def-9/view?usp=sharing \n\
                    文档 https://docs.google.com/document/d/DOC123/edit";
        let links = detect_links(text);

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].file_id, "1AbC_def-9");
        assert_eq!(links[0].kind, LinkKind::File);
        assert_eq!(
            links[0].download_url.as_deref(),
            Some("https://drive.google.com/uc?export=download&id=1AbC_def-9")
        );
        assert_eq!(links[1].kind, LinkKind::Document);
        assert!(links[1].download_url.is_none());
    }

    #[test]
    fn deduplicates_by_file_id() {
        let text = "https://drive.google.com/file/d/XYZ/view \
                    https://drive.google.com/open?id=XYZ \
                    https://drive.google.com/uc?export=download&id=XYZ";
        let links = detect_links(text);
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn detects_folders_and_ignores_plain_text() {
        let links = detect_links("https://drive.google.com/drive/folders/FOLDER_1");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].kind, LinkKind::Folder);

        assert!(detect_links("").is_empty());
        assert!(detect_links("没有任何链接 https://example.com/file/d/abc").is_empty());
    }
}
