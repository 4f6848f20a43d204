use super::*;

fn merged_str(style: ConflictStyle, base: &str, ours: &str, theirs: &str) -> (String, usize) {
    let result = merge_blobs(style, "ours", "theirs", base.as_bytes(), ours.as_bytes(), theirs.as_bytes());
    (String::from_utf8(result.bytes).unwrap(), result.conflicts)
}

#[test]
fn line_split_preserves_bytes() {
    let text = b"a\nb\nno-terminator";
    let lines = split_lines(text);
    assert_eq!(lines, vec![&b"a\n"[..], b"b\n", b"no-terminator"]);
    let rejoined: Vec<u8> = lines.concat();
    assert_eq!(rejoined, text);
}

#[test]
fn matches_anchor_on_unique_lines() {
    let a = split_lines(b"one\ntwo\nthree\n");
    let b = split_lines(b"one\ninserted\ntwo\nthree\n");
    let matches = line_matches(&a, &b);
    assert!(matches.contains(&(0, 0)));
    assert!(matches.contains(&(1, 2)));
    assert!(matches.contains(&(2, 3)));
}

#[test]
fn two_equal_inputs_return_the_third() {
    let (merged, conflicts) = merged_str(ConflictStyle::Merge, "base\n", "base\n", "edit\n");
    assert_eq!((merged.as_str(), conflicts), ("edit\n", 0));
    let (merged, conflicts) = merged_str(ConflictStyle::Merge, "base\n", "edit\n", "base\n");
    assert_eq!((merged.as_str(), conflicts), ("edit\n", 0));
    let (merged, conflicts) = merged_str(ConflictStyle::Merge, "base\n", "same\n", "same\n");
    assert_eq!((merged.as_str(), conflicts), ("same\n", 0));
}

#[test]
fn non_overlapping_edits_merge_cleanly() {
    let base = "one\ntwo\nthree\nfour\nfive\n";
    let ours = "ONE\ntwo\nthree\nfour\nfive\n";
    let theirs = "one\ntwo\nthree\nfour\nFIVE\n";
    let (merged, conflicts) = merged_str(ConflictStyle::Merge, base, ours, theirs);
    assert_eq!(conflicts, 0);
    assert_eq!(merged, "ONE\ntwo\nthree\nfour\nFIVE\n");
}

#[test]
fn appends_on_both_sides_conflict() {
    // the S4 shape: both sides append a different line
    let base = "original\n";
    let ours = "original\nmodified by a\n";
    let theirs = "original\nmodified by c\n";
    let (merged, conflicts) = merged_str(ConflictStyle::Merge, base, ours, theirs);
    assert_eq!(conflicts, 1);
    assert_eq!(
        merged,
        "original\n<<<<<<< ours\nmodified by a\n=======\nmodified by c\n>>>>>>> theirs\n"
    );
}

#[test]
fn diff3_style_includes_base_section() {
    let base = "line\n";
    let ours = "ours line\n";
    let theirs = "theirs line\n";
    let (merged, conflicts) = merged_str(ConflictStyle::Diff3, base, ours, theirs);
    assert_eq!(conflicts, 1);
    assert_eq!(
        merged,
        "<<<<<<< ours\nours line\n|||||||\nline\n=======\ntheirs line\n>>>>>>> theirs\n"
    );
}

#[test]
fn zdiff3_hoists_common_affixes() {
    let base = "start\nmiddle\nend\n";
    let ours = "start\ncommon\nA\ntail\nend\n";
    let theirs = "start\ncommon\nB\ntail\nend\n";
    let (merged, conflicts) = merged_str(ConflictStyle::Zdiff3, base, ours, theirs);
    assert_eq!(conflicts, 1);
    assert_eq!(
        merged,
        "start\ncommon\n<<<<<<< ours\nA\n|||||||\nmiddle\n=======\nB\n>>>>>>> theirs\ntail\nend\n"
    );
}

#[test]
fn missing_trailing_newline_still_produces_marker_lines() {
    let (merged, conflicts) =
        merged_str(ConflictStyle::Merge, "x", "x ours", "x theirs");
    assert_eq!(conflicts, 1);
    assert!(merged.starts_with("<<<<<<< ours\nx ours\n=======\nx theirs\n>>>>>>> theirs\n"));
}

#[test]
fn delete_vs_keep_takes_the_edit() {
    let base = "one\ntwo\nthree\n";
    let ours = "one\nthree\n"; // deleted `two`
    let theirs = "one\ntwo\nthree\n"; // untouched
    let (merged, conflicts) = merged_str(ConflictStyle::Merge, base, ours, theirs);
    assert_eq!(conflicts, 0);
    assert_eq!(merged, "one\nthree\n");
}

#[test]
fn conflict_style_parses_from_config_values() {
    assert_eq!("merge".parse::<ConflictStyle>().unwrap(), ConflictStyle::Merge);
    assert_eq!("diff3".parse::<ConflictStyle>().unwrap(), ConflictStyle::Diff3);
    assert_eq!("zdiff3".parse::<ConflictStyle>().unwrap(), ConflictStyle::Zdiff3);
    assert!("bogus".parse::<ConflictStyle>().is_err());
}
