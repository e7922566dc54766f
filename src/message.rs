//! Reconstruction of a message from DATA-phase lines: dot-unstuffing,
//! header/body split, and subject extraction.

/// Undoes SMTP transparency: a data line beginning with two or more dots
/// loses exactly one leading dot.
pub fn unstuff_line(line: &str) -> &str {
    if line.starts_with("..") {
        &line[1..]
    } else {
        line
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParsedMail {
    pub subject: String,
    pub body: String,
}

/// Splits the reconstructed text into headers and body on the first blank
/// line (`\r\n\r\n`, falling back to `\n\n`) and pulls the Subject header
/// out of the header block. Without a separator the whole text is the body
/// and the subject is empty.
pub fn parse_mail(raw: &str) -> ParsedMail {
    if let Some(idx) = raw.find("\r\n\r\n").filter(|&i| i > 0) {
        ParsedMail {
            subject: find_subject(&raw[..idx], "\r\n"),
            body: raw[idx + 4..].to_string(),
        }
    } else if let Some(idx) = raw.find("\n\n").filter(|&i| i > 0) {
        ParsedMail {
            subject: find_subject(&raw[..idx], "\n"),
            body: raw[idx + 2..].to_string(),
        }
    } else {
        ParsedMail {
            subject: String::new(),
            body: raw.to_string(),
        }
    }
}

fn find_subject(headers: &str, line_sep: &str) -> String {
    for line in headers.split(line_sep) {
        let is_subject = line
            .get(..8)
            .map_or(false, |head| head.eq_ignore_ascii_case("subject:"));
        if is_subject {
            return line[8..].trim().to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unstuffing_removes_one_leading_dot() {
        assert_eq!(unstuff_line("..foo"), ".foo");
        assert_eq!(unstuff_line("...foo"), "..foo");
        assert_eq!(unstuff_line(".."), ".");
    }

    #[test]
    fn unstuffing_leaves_other_lines_alone() {
        assert_eq!(unstuff_line("foo"), "foo");
        assert_eq!(unstuff_line(".foo"), ".foo");
        assert_eq!(unstuff_line(""), "");
    }

    #[test]
    fn unstuffing_is_idempotent_on_unstuffed_input() {
        // ".foo" has a single dot, so a second pass changes nothing.
        let once = unstuff_line("..foo").to_string();
        assert_eq!(unstuff_line(&once), once);
    }

    #[test]
    fn splits_on_crlf_separator() {
        let parsed = parse_mail("Subject: Hi\r\nFrom: a@x\r\n\r\nthe body");
        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.body, "the body");
    }

    #[test]
    fn falls_back_to_lf_separator() {
        let parsed = parse_mail("Subject: Hi\nFrom: a@x\n\nthe body");
        assert_eq!(parsed.subject, "Hi");
        assert_eq!(parsed.body, "the body");
    }

    #[test]
    fn no_separator_means_body_only() {
        let parsed = parse_mail("just some text without headers");
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.body, "just some text without headers");
    }

    #[test]
    fn subject_match_is_case_insensitive() {
        let parsed = parse_mail("SUBJECT:   spaced out   \r\n\r\nbody");
        assert_eq!(parsed.subject, "spaced out");
    }

    #[test]
    fn first_subject_header_wins() {
        let parsed = parse_mail("Subject: first\r\nSubject: second\r\n\r\nbody");
        assert_eq!(parsed.subject, "first");
    }

    #[test]
    fn missing_subject_header_yields_empty_subject() {
        let parsed = parse_mail("From: a@x\r\nTo: b@y\r\n\r\nbody");
        assert_eq!(parsed.subject, "");
    }

    #[test]
    fn body_keeps_its_own_blank_lines() {
        let parsed = parse_mail("Subject: x\r\n\r\nline one\r\n\r\nline two");
        assert_eq!(parsed.body, "line one\r\n\r\nline two");
    }

    #[test]
    fn subject_only_counts_in_header_block() {
        let parsed = parse_mail("From: a@x\r\n\r\nSubject: not a header");
        assert_eq!(parsed.subject, "");
        assert_eq!(parsed.body, "Subject: not a header");
    }
}
