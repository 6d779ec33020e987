//! Forum post HTML to markdown.
//!
//! NodeBB renders posts to a small, predictable subset of HTML, so a handful of
//! rewrite rules is enough: block elements become blank-line separated
//! paragraphs, inline formatting becomes markdown punctuation, links and images
//! keep their targets, and every other tag is dropped.

use regex_lite::{Captures, Regex};

fn replace_all(text: &str, pattern: &str, replacement: &str) -> String {
    match Regex::new(pattern) {
        Ok(re) => re.replace_all(text, replacement).into_owned(),
        Err(_) => text.to_string(),
    }
}

fn replace_with(text: &str, pattern: &str, f: impl Fn(&Captures) -> String) -> String {
    match Regex::new(pattern) {
        Ok(re) => re.replace_all(text, |caps: &Captures| f(caps)).into_owned(),
        Err(_) => text.to_string(),
    }
}

pub fn html_to_markdown(html: &str) -> String {
    let mut text = html.replace("\r\n", "\n");

    // Code blocks first so their contents escape inline rewriting.
    text = replace_with(
        &text,
        r"(?is)<pre[^>]*>\s*(?:<code[^>]*>)?(.*?)(?:</code>)?\s*</pre>",
        |caps| format!("\n\n```\n{}\n```\n\n", caps[1].trim_end()),
    );
    text = replace_all(&text, r"(?is)<code[^>]*>(.*?)</code>", "`$1`");

    text = replace_with(&text, r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]>", |caps| {
        let level = caps[1].parse::<usize>().unwrap_or(1);
        format!("\n\n{} {}\n\n", "#".repeat(level), caps[2].trim())
    });

    text = replace_with(&text, r"(?is)<img([^>]*)>", |caps| {
        let src = attribute(&caps[1], "src").unwrap_or_default();
        let alt = attribute(&caps[1], "alt").unwrap_or_default();
        format!("![{}]({})", alt, src)
    });
    text = replace_with(&text, r"(?is)<a\s([^>]*)>(.*?)</a>", |caps| {
        let label = caps[2].trim();
        match attribute(&caps[1], "href") {
            Some(href) if !label.is_empty() && label != href => format!("[{}]({})", label, href),
            Some(href) => href,
            None => label.to_string(),
        }
    });

    text = replace_all(&text, r"(?is)<(?:strong|b)(?:\s[^>]*)?>(.*?)</(?:strong|b)>", "**$1**");
    text = replace_all(&text, r"(?is)<(?:em|i)(?:\s[^>]*)?>(.*?)</(?:em|i)>", "*$1*");
    text = replace_all(&text, r"(?is)<(?:del|s)(?:\s[^>]*)?>(.*?)</(?:del|s)>", "~~$1~~");

    text = replace_with(&text, r"(?is)<blockquote[^>]*>(.*?)</blockquote>", |caps| {
        let inner = collapse_blank_lines(&strip_block_tags(&caps[1]));
        let quoted = inner
            .trim()
            .lines()
            .map(|line| {
                if line.is_empty() {
                    ">".to_string()
                } else {
                    format!("> {}", line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n\n{}\n\n", quoted)
    });

    text = replace_all(&text, r"(?is)<li[^>]*>(.*?)</li>", "\n* $1");
    text = strip_block_tags(&text);
    text = replace_all(&text, r"(?s)<[^>]+>", "");

    collapse_blank_lines(&decode_entities(&text)).trim().to_string()
}

/// Drop every tag and collapse whitespace, for short inline fragments.
pub fn html_to_text(html: &str) -> String {
    let text = replace_all(html, r"(?s)<[^>]+>", "");
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r#"(?i)\b{}\s*=\s*"([^"]*)""#, name)).ok()?;
    re.captures(attrs).map(|caps| caps[1].to_string())
}

fn strip_block_tags(text: &str) -> String {
    let text = replace_all(text, r"(?i)<br\s*/?>", "\n");
    let text = replace_all(&text, r"(?i)<hr\s*/?>", "\n\n---\n\n");
    let text = replace_all(&text, r"(?i)</?(?:ul|ol)[^>]*>", "\n");
    replace_all(&text, r"(?i)</?(?:p|div)(?:\s[^>]*)?>", "\n\n")
}

fn collapse_blank_lines(text: &str) -> String {
    let trimmed = text
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    replace_all(&trimmed, r"\n{3,}", "\n\n")
}

fn decode_entities(text: &str) -> String {
    let text = replace_with(text, r"&#(x?)([0-9a-fA-F]+);", |caps| {
        let radix = if caps[1].is_empty() { 10 } else { 16 };
        u32::from_str_radix(&caps[2], radix)
            .ok()
            .and_then(char::from_u32)
            .map(|c| c.to_string())
            .unwrap_or_default()
    });
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_and_inline_formatting() {
        let html = "<p>Hello <strong>world</strong>, this is <em>fine</em>.</p>\n<p>Second<br />line</p>";
        assert_eq!(
            html_to_markdown(html),
            "Hello **world**, this is *fine*.\n\nSecond\nline"
        );
    }

    #[test]
    fn links_images_and_mentions() {
        let html = r#"<p><a class="plugin-mentions-user" href="https://forum.example/uid/5">@clippy</a> look at <img src="/assets/uploads/cat.jpg" alt="cat.jpg" class="img-fluid" /></p>"#;
        assert_eq!(
            html_to_markdown(html),
            "[@clippy](https://forum.example/uid/5) look at ![cat.jpg](/assets/uploads/cat.jpg)"
        );
    }

    #[test]
    fn bare_links_stay_clickable() {
        let html = r#"<a href="https://example.com">https://example.com</a>"#;
        assert_eq!(html_to_markdown(html), "https://example.com");
    }

    #[test]
    fn code_blocks_and_entities() {
        let html = "<pre><code>if a &lt; b {\n    run();\n}</code></pre><p>use <code>x &amp;&amp; y</code> &quot;here&quot;&#39;s&nbsp;it</p>";
        assert_eq!(
            html_to_markdown(html),
            "```\nif a < b {\n    run();\n}\n```\n\nuse `x && y` \"here\"'s it"
        );
    }

    #[test]
    fn quotes_and_lists() {
        let html = "<blockquote><p>quoted text</p><p>more</p></blockquote><ul><li>one</li><li>two</li></ul>";
        assert_eq!(
            html_to_markdown(html),
            "> quoted text\n>\n> more\n\n* one\n* two"
        );
    }

    #[test]
    fn plain_text_fragments() {
        assert_eq!(
            html_to_text("The <b>Rust</b>\n  Programming &amp; Language"),
            "The Rust Programming & Language"
        );
    }
}
