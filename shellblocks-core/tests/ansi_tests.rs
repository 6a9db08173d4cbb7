//! SGR parsing and stripping.

use shellblocks_core::ansi::{self, palette, Rgb, Style, Theme};

fn concat(text: &str) -> String {
    ansi::parse(text).iter().map(|s| s.text).collect()
}

// ════════════════════════════════════════════════════════════════
// parse
// ════════════════════════════════════════════════════════════════

#[test]
fn test_bold_red_error_then_plain() {
    let text = "\u{1b}[1;31mError\u{1b}[0m: missing file";
    let segments = ansi::parse(text);

    assert_eq!(segments.len(), 2);
    assert_eq!(segments[0].text, "Error");
    assert!(segments[0].style.bold);
    assert_eq!(segments[0].style.color, Some(1));
    assert_eq!(segments[1].text, ": missing file");
    assert!(segments[1].style.is_plain());

    assert_eq!(ansi::strip(text), "Error: missing file");
}

#[test]
fn test_plain_text_is_one_unstyled_segment() {
    let segments = ansi::parse("hello world\n");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].text, "hello world\n");
    assert_eq!(segments[0].style, Style::default());
}

#[test]
fn test_empty_input_has_no_segments() {
    assert!(ansi::parse("").is_empty());
    assert!(ansi::parse("\u{1b}[1m\u{1b}[0m").is_empty());
}

#[test]
fn test_toggles_are_independent() {
    let segments = ansi::parse("\u{1b}[1;3;4mA\u{1b}[22mB\u{1b}[23mC\u{1b}[24mD");
    let styles: Vec<(bool, bool, bool)> = segments
        .iter()
        .map(|s| (s.style.bold, s.style.italic, s.style.underline))
        .collect();
    assert_eq!(
        styles,
        vec![
            (true, true, true),
            (false, true, true),
            (false, false, true),
            (false, false, false)
        ]
    );
}

#[test]
fn test_bright_colors_map_to_upper_palette() {
    let segments = ansi::parse("\u{1b}[92mok\u{1b}[39m done");
    assert_eq!(segments[0].style.color, Some(10));
    assert_eq!(segments[1].style.color, None);
}

#[test]
fn test_empty_parameters_reset() {
    let segments = ansi::parse("\u{1b}[1mA\u{1b}[mB");
    assert!(segments[0].style.bold);
    assert!(segments[1].style.is_plain());
}

#[test]
fn test_background_and_unknown_params_are_consumed_without_effect() {
    let segments = ansi::parse("\u{1b}[41;7;5mX");
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].text, "X");
    assert!(segments[0].style.is_plain());
}

#[test]
fn test_extended_foreground_inside_palette_is_used() {
    let segments = ansi::parse("\u{1b}[38;5;4mblue\u{1b}[38;5;200mpink");
    assert_eq!(segments[0].style.color, Some(4));
    // 200 is outside the 16 colors: previous color stays.
    assert_eq!(segments[1].style.color, Some(4));
}

#[test]
fn test_truecolor_and_background_selectors_are_skipped_whole() {
    // The 1 after the rgb triple must still apply as bold.
    let segments = ansi::parse("\u{1b}[38;2;10;20;30;1mX\u{1b}[48;5;1;3mY");
    assert!(segments[0].style.bold);
    assert_eq!(segments[0].style.color, None);
    assert!(segments[1].style.italic);
}

#[test]
fn test_malformed_extended_selector_is_recovered() {
    let segments = ansi::parse("\u{1b}[38;9mX\u{1b}[1mY");
    assert_eq!(concat("\u{1b}[38;9mX\u{1b}[1mY"), "XY");
    assert!(segments[1].style.bold);
}

#[test]
fn test_parse_from_carries_style_between_calls() {
    let (first, style) = ansi::parse_from(Style::default(), "\u{1b}[31mred ");
    assert_eq!(first[0].style.color, Some(1));

    let (second, end) = ansi::parse_from(style, "still red\u{1b}[0m");
    assert_eq!(second[0].text, "still red");
    assert_eq!(second[0].style.color, Some(1));
    assert!(end.is_plain());
}

// ════════════════════════════════════════════════════════════════
// strip
// ════════════════════════════════════════════════════════════════

#[test]
fn test_strip_leaves_non_sgr_escapes_alone() {
    let text = "\u{1b}[2Jclear\u{1b}]0;title\u{7}\u{1b}[32mgreen";
    assert_eq!(ansi::strip(text), "\u{1b}[2Jclear\u{1b}]0;title\u{7}green");
}

#[test]
fn test_concatenated_segments_equal_stripped_text() {
    let samples = [
        "plain",
        "\u{1b}[1;31mError\u{1b}[0m: missing file",
        "a\u{1b}[Kb\u{1b}[0;1;4;95mc\u{1b}[m",
        "\u{1b}[38;5;3mx\u{1b}[48;2;1;2;3my\u{1b}",
        "unicode ✓ \u{1b}[32mgrün\u{1b}[0m",
        "\u{1b}[",
    ];
    for sample in samples {
        assert_eq!(concat(sample), ansi::strip(sample), "sample {sample:?}");
        assert_eq!(ansi::strip(&concat(sample)), ansi::strip(sample));
    }
}

// ════════════════════════════════════════════════════════════════
// split_incomplete
// ════════════════════════════════════════════════════════════════

#[test]
fn test_split_holds_back_partial_sequence() {
    assert_eq!(ansi::split_incomplete("abc\u{1b}[1;3"), ("abc", "\u{1b}[1;3"));
    assert_eq!(ansi::split_incomplete("abc\u{1b}"), ("abc", "\u{1b}"));
    assert_eq!(ansi::split_incomplete("abc\u{1b}[1m"), ("abc\u{1b}[1m", ""));
    assert_eq!(ansi::split_incomplete("abc"), ("abc", ""));
}

// ════════════════════════════════════════════════════════════════
// palette
// ════════════════════════════════════════════════════════════════

#[test]
fn test_palette_differs_per_theme() {
    for i in 0..16u8 {
        let light = palette::color(i, Theme::Light);
        let dark = palette::color(i, Theme::Dark);
        assert!(light.is_some() && dark.is_some());
        assert_ne!(light, dark, "index {i}");
    }
    assert_eq!(palette::color(16, Theme::Dark), None);
}

#[test]
fn test_style_resolves_foreground() {
    let style = Style {
        color: Some(1),
        ..Style::default()
    };
    assert_eq!(style.foreground(Theme::Dark), palette::color(1, Theme::Dark));
    assert_eq!(Style::default().foreground(Theme::Light), None);
    assert_eq!(Rgb(0xe0, 0x5a, 0x5a).to_hex(), "#e05a5a");
}
