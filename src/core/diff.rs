// Positional keyword-list comparison deciding whether a refresh is worth reporting.
use crate::core::keyword::KeywordInfo;

/// Reports whether `new` differs from `old` in a way listeners should hear about.
///
/// Comparison is a positional zip: reordering counts as a change, and no
/// attempt is made to match keywords by name.
pub fn materially_changed(old: Option<&[KeywordInfo]>, new: Option<&[KeywordInfo]>) -> bool {
    let (old, new) = match (old, new) {
        (None, None) => return false,
        (Some(old), Some(new)) => (old, new),
        _ => return true,
    };
    if old.len() != new.len() {
        return true;
    }
    old.iter().zip(new).any(|(a, b)| keyword_differs(a, b))
}

fn keyword_differs(a: &KeywordInfo, b: &KeywordInfo) -> bool {
    a.name != b.name || a.doc != b.doc || a.arguments != b.arguments || a.source != b.source
}
