//! Low-level AcroForm access using [`lopdf`].
//!
//! We only need a small slice of the PDF form model: find every widget
//! annotation, work out its field name and type (either of which may be
//! inherited from a parent field), read its current value, and find the "on"
//! appearance state of checkboxes.

use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};

use crate::prelude::*;

/// How deep we'll follow `/Parent` links before giving up. Real forms are
/// rarely more than a few levels deep, and this protects us from cycles.
const MAX_FIELD_DEPTH: usize = 32;

/// The appearance state meaning "unchecked".
const OFF_STATE: &[u8] = b"Off";

/// The form field types we know how to fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// `/Tx`
    Text,
    /// `/Btn`, which covers checkboxes.
    Button,
    /// `/Ch`, dropdowns and list boxes.
    Choice,
}

impl FieldKind {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"Tx" => Some(Self::Text),
            b"Btn" => Some(Self::Button),
            b"Ch" => Some(Self::Choice),
            _ => None,
        }
    }
}

/// A widget annotation and the field it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Widget {
    /// The annotation itself, which holds `/AS`.
    pub widget_id: ObjectId,
    /// The nearest dictionary with a `/T`, which holds `/V`. Often the same as
    /// `widget_id`.
    pub field_id: ObjectId,
    /// The field's (partial) name.
    pub name: String,
    /// The field type, if we recognize it.
    pub kind: Option<FieldKind>,
    /// The current value, decoded to text.
    pub value: Option<String>,
    /// For buttons, the name of the "on" appearance state.
    pub on_state: Option<Vec<u8>>,
}

/// Find every named widget on every page, in page order.
///
/// Annotations without a name, and inline annotations we couldn't update
/// anyway, are skipped.
pub fn scan_widgets(doc: &Document) -> Vec<Widget> {
    let mut widgets = vec![];
    for (page_number, page_id) in doc.get_pages() {
        let Some(annots) = doc
            .get_object(page_id)
            .and_then(Object::as_dict)
            .ok()
            .and_then(|page| page.get(b"Annots").ok())
            .and_then(|annots| resolve(doc, annots))
            .and_then(|annots| annots.as_array().ok())
        else {
            continue;
        };
        for annot in annots {
            let Ok(widget_id) = annot.as_reference() else {
                debug!(page_number, "Skipping inline annotation");
                continue;
            };
            match scan_widget(doc, widget_id) {
                Some(widget) => widgets.push(widget),
                None => debug!(page_number, ?widget_id, "Skipping unnamed annotation"),
            }
        }
    }
    widgets
}

fn scan_widget(doc: &Document, widget_id: ObjectId) -> Option<Widget> {
    let (field_id, name) = find_inherited(doc, widget_id, b"T")?;
    let name = object_text(name)?;
    let kind = find_inherited(doc, widget_id, b"FT")
        .and_then(|(_, ft)| ft.as_name().ok())
        .and_then(FieldKind::from_name);
    let value = find_inherited(doc, field_id, b"V").and_then(|(_, v)| object_text(v));
    let widget = doc.get_object(widget_id).and_then(Object::as_dict).ok()?;
    let on_state = match kind {
        Some(FieldKind::Button) => checkbox_on_state(doc, widget),
        _ => None,
    };
    Some(Widget {
        widget_id,
        field_id,
        name,
        kind,
        value,
        on_state,
    })
}

/// Look up `key` on `id` or its nearest ancestor that has it. Returns the ID
/// of the dictionary where we found it, too.
fn find_inherited<'a>(
    doc: &'a Document,
    id: ObjectId,
    key: &[u8],
) -> Option<(ObjectId, &'a Object)> {
    let mut id = id;
    for _ in 0..MAX_FIELD_DEPTH {
        let dict = doc.get_object(id).and_then(Object::as_dict).ok()?;
        if let Ok(value) = dict.get(key) {
            return Some((id, value));
        }
        id = dict.get(b"Parent").and_then(Object::as_reference).ok()?;
    }
    None
}

/// Follow a reference, if `obj` is one.
fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// The first appearance state in `/AP /N` that isn't `Off`.
///
/// Most checkboxes have exactly one such state, but its name varies from
/// form to form (`Yes`, `On`, `1`, `Y`...). If there's more than one, we take
/// the first in dictionary order.
pub fn checkbox_on_state(doc: &Document, widget: &Dictionary) -> Option<Vec<u8>> {
    let ap = resolve(doc, widget.get(b"AP").ok()?)?.as_dict().ok()?;
    let normal = resolve(doc, ap.get(b"N").ok()?)?.as_dict().ok()?;
    normal
        .iter()
        .map(|(state, _)| state)
        .find(|state| state.as_slice() != OFF_STATE)
        .cloned()
}

/// Encode a PDF text string. ASCII is written as a literal string; anything
/// else as UTF-16BE with a byte order mark.
pub fn encode_text_string(text: &str) -> Object {
    if text.is_ascii() {
        Object::string_literal(text)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

/// Decode a PDF text string. We handle UTF-16BE with a byte order mark, and
/// treat everything else as Latin-1, which is close enough to PDFDocEncoding
/// for field names and values.
pub fn decode_text_string(bytes: &[u8]) -> String {
    match bytes.strip_prefix(&[0xFE, 0xFF]) {
        Some(utf16) => {
            let units = utf16
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect::<Vec<_>>();
            String::from_utf16_lossy(&units)
        }
        None => bytes.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Get the text of a string or name object.
fn object_text(obj: &Object) -> Option<String> {
    match obj {
        Object::String(bytes, _) => Some(decode_text_string(bytes)),
        Object::Name(name) => Some(String::from_utf8_lossy(name).into_owned()),
        _ => None,
    }
}

/// Set a key on the dictionary `id`.
pub fn set_key(doc: &mut Document, id: ObjectId, key: &str, value: Object) -> Result<()> {
    doc.get_object_mut(id)
        .and_then(Object::as_dict_mut)
        .with_context(|| format!("object {id:?} is not a dictionary"))?
        .set(key, value);
    Ok(())
}

/// Ask viewers to regenerate field appearances from our values.
pub fn set_need_appearances(doc: &mut Document) -> Result<()> {
    let root_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .context("PDF has no document catalog")?;
    let acroform = doc
        .get_object(root_id)
        .and_then(Object::as_dict)
        .and_then(|catalog| catalog.get(b"AcroForm"))
        .context("PDF has no AcroForm")?
        .clone();
    match acroform {
        Object::Reference(id) => set_key(doc, id, "NeedAppearances", Object::Boolean(true)),
        Object::Dictionary(_) => {
            doc.get_object_mut(root_id)
                .and_then(Object::as_dict_mut)
                .and_then(|catalog| catalog.get_mut(b"AcroForm"))
                .and_then(Object::as_dict_mut)
                .context("AcroForm is not a dictionary")?
                .set("NeedAppearances", Object::Boolean(true));
            Ok(())
        }
        _ => Err(anyhow!("AcroForm is not a dictionary")),
    }
}

#[cfg(test)]
mod tests {
    use lopdf::dictionary;

    use super::*;

    #[test]
    fn on_state_is_first_non_off_key() {
        let doc = Document::with_version("1.5");
        let widget = dictionary! {
            "AP" => dictionary! {
                "N" => dictionary! { "Off" => Object::Null, "Yes" => Object::Null },
            },
        };
        assert_eq!(checkbox_on_state(&doc, &widget), Some(b"Yes".to_vec()));

        let widget = dictionary! {
            "AP" => dictionary! {
                "N" => dictionary! { "1" => Object::Null, "Off" => Object::Null },
            },
        };
        assert_eq!(checkbox_on_state(&doc, &widget), Some(b"1".to_vec()));
    }

    #[test]
    fn missing_appearances_have_no_on_state() {
        let doc = Document::with_version("1.5");
        assert_eq!(checkbox_on_state(&doc, &dictionary! {}), None);
        let only_off = dictionary! {
            "AP" => dictionary! { "N" => dictionary! { "Off" => Object::Null } },
        };
        assert_eq!(checkbox_on_state(&doc, &only_off), None);
    }

    #[test]
    fn appearance_dictionaries_may_be_references() {
        let mut doc = Document::with_version("1.5");
        let normal = doc.add_object(dictionary! { "Off" => Object::Null, "On" => Object::Null });
        let ap = doc.add_object(dictionary! { "N" => normal });
        let widget = dictionary! { "AP" => ap };
        assert_eq!(checkbox_on_state(&doc, &widget), Some(b"On".to_vec()));
    }

    #[test]
    fn text_strings_use_utf16_only_when_needed() {
        assert!(matches!(
            encode_text_string("Smith"),
            Object::String(bytes, StringFormat::Literal) if bytes == b"Smith"
        ));
        let Object::String(bytes, StringFormat::Hexadecimal) = encode_text_string("Zoë")
        else {
            panic!("expected a hex string");
        };
        assert_eq!(bytes, vec![0xFE, 0xFF, 0x00, b'Z', 0x00, b'o', 0x00, 0xEB]);
        assert_eq!(decode_text_string(&bytes), "Zoë");
        assert_eq!(decode_text_string(b"Smith"), "Smith");
    }

    #[test]
    fn names_and_types_are_inherited_from_parents() {
        let mut doc = Document::with_version("1.5");
        let parent_id = doc.new_object_id();
        let kid_id = doc.add_object(dictionary! {
            "Type" => "Annot",
            "Subtype" => "Widget",
            "Parent" => parent_id,
        });
        doc.objects.insert(
            parent_id,
            Object::Dictionary(dictionary! {
                "FT" => "Ch",
                "T" => Object::string_literal("State"),
                "V" => Object::string_literal("MA"),
                "Kids" => vec![kid_id.into()],
            }),
        );
        let pages_id = doc.new_object_id();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Annots" => vec![kid_id.into()],
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! { "Type" => "Catalog", "Pages" => pages_id });
        doc.trailer.set("Root", catalog_id);

        let widgets = scan_widgets(&doc);
        assert_eq!(
            widgets,
            vec![Widget {
                widget_id: kid_id,
                field_id: parent_id,
                name: "State".to_owned(),
                kind: Some(FieldKind::Choice),
                value: Some("MA".to_owned()),
                on_state: None,
            }]
        );
    }
}
