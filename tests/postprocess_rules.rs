use ocr_foreman::config::Postprocess;
use ocr_foreman::postprocess::{script_of, Postprocessor, Script};

fn post() -> Postprocessor {
    Postprocessor::new(&Postprocess::default()).unwrap()
}

#[test]
fn language_tags_map_to_scripts() {
    assert_eq!(script_of("hebrew"), Script::Hebrew);
    assert_eq!(script_of("he"), Script::Hebrew);
    assert_eq!(script_of("English"), Script::Latin);
    assert_eq!(script_of("mixed"), Script::Mixed);
    assert_eq!(script_of(""), Script::Mixed);
    assert_eq!(script_of("klingon"), Script::Mixed);
}

#[test]
fn repairs_latin_line_break_hyphenation() {
    let cleaned = post().clean("This is an exam-\nple of a break.", "english");
    assert!(cleaned.contains("example"));
    assert!(!cleaned.contains("exam-"));
}

#[test]
fn repairs_hebrew_gershayim() {
    let cleaned = post().clean("צה\"ל", "hebrew");
    assert!(cleaned.contains('\u{05F4}'));
    assert!(!cleaned.contains('"'));
}

#[test]
fn mixed_applies_both_rule_sets() {
    let cleaned = post().clean("exam-\nple and צה\"ל", "mixed");
    assert!(cleaned.contains("example"));
    assert!(cleaned.contains('\u{05F4}'));
}

#[test]
fn hebrew_text_keeps_latin_hyphen_breaks_intact() {
    // The Latin repair is keyed off the tag, not the content.
    let cleaned = post().clean("exam-\nple", "hebrew");
    assert!(cleaned.contains("exam-"));
}

#[test]
fn normalizes_quote_variants() {
    let cleaned = post().clean("\u{201C}quoted\u{201D} and \u{2018}single\u{2019}", "english");
    assert!(cleaned.contains("\"quoted\""));
    assert!(cleaned.contains("'single'"));
}

#[test]
fn strips_control_and_zero_width_chars() {
    let cleaned = post().clean("Alpha\u{0002}Beta\u{200B}Gamma\nKeeps\tthese", "english");
    assert!(cleaned.contains("AlphaBetaGamma"));
    assert!(cleaned.contains('\n'));
    assert!(cleaned.contains('\t'));
}

#[test]
fn removes_ocr_artifact_runs() {
    let cleaned = post().clean("header \u{2500}\u{2500}\u{2500} body \u{FFFD}\u{FFFD} tail", "english");
    assert!(!cleaned.contains('\u{2500}'));
    assert!(!cleaned.contains('\u{FFFD}'));
    assert!(cleaned.contains("header"));
    assert!(cleaned.contains("tail"));
}

#[test]
fn collapses_runs_of_spaces_and_space_before_punctuation() {
    let cleaned = post().clean("a  long   gap , then more .", "english");
    assert!(cleaned.contains("a long gap,"));
    assert!(cleaned.contains("more."));
}
