use std::sync::LazyLock;

use regex::Regex;

use crate::types::FileType;

struct SubjectRule {
    re: Regex,
    filetype: FileType,
}

/// Quoted-filename forms are listed before bare-extension fallbacks so the
/// filename capture prefers what the poster actually quoted.
static SUBJECT_TABLE: LazyLock<Vec<SubjectRule>> = LazyLock::new(|| {
    let rule = |pattern: &str, filetype| SubjectRule {
        re: Regex::new(pattern).expect("valid subject regex"),
        filetype,
    };
    vec![
        rule(
            r#"(?i).*(?:"|&quot;|&#34;)(.+\.r(?:ar|\d+))(?:"|&quot;|&#34;) yEnc"#,
            FileType::Rar,
        ),
        rule(r"(?i)(.+\.r(?:ar|\d+))", FileType::Rar),
        rule(
            r#"(?i).*(?:"|&quot;|&#34;)(.+\.par2)(?:"|&quot;|&#34;) yEnc"#,
            FileType::Par2,
        ),
        rule(r"(?i)(.+\.par2)", FileType::Par2),
        rule(
            r#"(?i).*(?:"|&quot;|&#34;)(.+\.nfo)(?:"|&quot;|&#34;) yEnc"#,
            FileType::Nfo,
        ),
        rule(r"(?i)(.+\.nfo)", FileType::Nfo),
        rule(
            r#"(?i).*(?:"|&quot;|&#34;)(.+\.sfv)(?:"|&quot;|&#34;) yEnc"#,
            FileType::Sfv,
        ),
        rule(r"(?i)(.+\.sfv)", FileType::Sfv),
    ]
});

/// Classify an NZB subject line by its (quoted or bare) file extension.
pub fn subject_type(subject: &str) -> FileType {
    for rule in SUBJECT_TABLE.iter() {
        if rule.re.is_match(subject) {
            return rule.filetype;
        }
    }
    FileType::Unknown
}

/// Extract the posted filename from an NZB subject line, if one is
/// recognizable.
pub fn subject_filename(subject: &str) -> String {
    for rule in SUBJECT_TABLE.iter() {
        if let Some(caps) = rule.re.captures(subject)
            && let Some(name) = caps.get(1)
        {
            return name.as_str().to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_quoted_subjects() {
        let cases = [
            (
                r#"Big.Post [01/30] - "big.post.part01.rar" yEnc (1/50)"#,
                FileType::Rar,
                "big.post.part01.rar",
            ),
            (
                r#"Big.Post [29/30] - "big.post.vol00+01.par2" yEnc (1/3)"#,
                FileType::Par2,
                "big.post.vol00+01.par2",
            ),
            (
                r#"Big.Post [30/30] - "big.post.nfo" yEnc (1/1)"#,
                FileType::Nfo,
                "big.post.nfo",
            ),
            (
                r#"Big.Post [28/30] - "big.post.sfv" yEnc (1/1)"#,
                FileType::Sfv,
                "big.post.sfv",
            ),
        ];
        for (subject, filetype, filename) in cases {
            assert_eq!(subject_type(subject), filetype, "{subject}");
            assert_eq!(subject_filename(subject), filename, "{subject}");
        }
    }

    #[test]
    fn classifies_html_escaped_quotes() {
        let subject = "Post &quot;archive.r42&quot; yEnc (3/9)";
        assert_eq!(subject_type(subject), FileType::Rar);
        assert_eq!(subject_filename(subject), "archive.r42");
    }

    #[test]
    fn falls_back_to_bare_extensions() {
        assert_eq!(subject_type("repair.par2"), FileType::Par2);
        assert_eq!(subject_type("unquoted archive.rar post"), FileType::Rar);
    }

    #[test]
    fn unrecognized_subjects_are_unknown() {
        assert_eq!(subject_type("a mystery post with no extension"), FileType::Unknown);
        assert_eq!(subject_filename("a mystery post with no extension"), "");
    }
}
