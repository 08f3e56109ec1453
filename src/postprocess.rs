use crate::config::Postprocess;
use anyhow::{Context, Result};
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Script family a page's cleanup rules are keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Latin,
    Hebrew,
    Mixed,
}

/// Map the worker's language tag onto a script family. Unknown or missing
/// tags get the combined treatment.
pub fn script_of(language: &str) -> Script {
    match language.trim().to_ascii_lowercase().as_str() {
        "hebrew" | "heb" | "he" => Script::Hebrew,
        "english" | "eng" | "en" | "latin" => Script::Latin,
        _ => Script::Mixed,
    }
}

/// OCR text cleanup with the regexes compiled once per run.
pub struct Postprocessor {
    cfg: Postprocess,
    artifacts: Vec<Regex>,
    latin_hyphen_break: Regex,
    space_before_punct: Regex,
    hebrew_gershayim: Regex,
    multi_space: Regex,
}

impl Postprocessor {
    pub fn new(cfg: &Postprocess) -> Result<Self> {
        let artifacts = cfg
            .artifact_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("artifact pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            cfg: cfg.clone(),
            artifacts,
            // A word broken across a rasterized line: "exam-\nple" -> "example".
            latin_hyphen_break: Regex::new(r"([A-Za-z])-[ \t]*\n[ \t]*([a-z])")?,
            space_before_punct: Regex::new(r"[ \t]+([,.;:!?])")?,
            // ASCII quote standing in for gershayim inside a Hebrew word.
            hebrew_gershayim: Regex::new("([\u{05D0}-\u{05EA}])\"([\u{05D0}-\u{05EA}])")?,
            multi_space: Regex::new(r"[ \t]{2,}")?,
        })
    }

    /// Clean one page of OCR output, keyed on the detected language.
    pub fn clean(&self, text: &str, language: &str) -> String {
        let script = script_of(language);
        let mut s = text.replace("\r\n", "\n");

        if self.cfg.strip_control_chars {
            s = strip_control_chars(&s);
        }

        for re in &self.artifacts {
            s = re.replace_all(&s, "").into_owned();
        }

        if self.cfg.normalize_unicode {
            s = s.nfkc().collect::<String>();
        }

        if self.cfg.normalize_quotes {
            s = normalize_quotes(&s);
        }

        if self.cfg.repair_spacing {
            if matches!(script, Script::Latin | Script::Mixed) {
                s = self.latin_hyphen_break.replace_all(&s, "$1$2").into_owned();
            }
            if matches!(script, Script::Hebrew | Script::Mixed) {
                s = self.hebrew_gershayim.replace_all(&s, "$1\u{05F4}$2").into_owned();
            }
            s = self.space_before_punct.replace_all(&s, "$1").into_owned();
        }

        if self.cfg.collapse_spaces {
            s = self.multi_space.replace_all(&s, " ").into_owned();
            s = s
                .lines()
                .map(|l| l.trim_end())
                .collect::<Vec<_>>()
                .join("\n");
        }

        s.trim().to_string()
    }
}

fn strip_control_chars(s: &str) -> String {
    s.chars()
        .filter(|&ch| {
            if ch == '\n' || ch == '\t' {
                return true;
            }
            if ch.is_control() {
                return false;
            }
            // Zero-width marks that OCR engines leak into text.
            !matches!(ch, '\u{200B}'..='\u{200D}' | '\u{FEFF}')
        })
        .collect()
}

fn normalize_quotes(s: &str) -> String {
    s.chars()
        .map(|ch| match ch {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' | '`' | '\u{00B4}' => '\'',
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => '"',
            _ => ch,
        })
        .collect()
}
