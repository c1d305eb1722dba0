//! Interactive element detection
//!
//! Pure function over one [`DomNode`]; everything it needs (layout box,
//! cursor, inherited inert/aria-hidden flags, accessibility role) is already on
//! the node.

use phf::phf_set;

use super::node::{DomNode, NodeKind};

/// Tags that are interactive on their own
static INTERACTIVE_TAGS: phf::Set<&'static str> = phf_set! {
    "button",
    "input",
    "select",
    "textarea",
    "option",
    "details",
    "summary",
    "embed",
    "menuitem",
};

/// Accessibility roles that accept user input
static INTERACTIVE_ROLES: phf::Set<&'static str> = phf_set! {
    "button",
    "link",
    "checkbox",
    "radio",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "tab",
    "switch",
    "textbox",
    "searchbox",
    "combobox",
    "listbox",
    "option",
    "slider",
    "spinbutton",
    "treeitem",
    "gridcell",
    "columnheader",
};

/// Whether the node should get an interactive index
pub fn is_interactive(node: &DomNode) -> bool {
    if node.kind != NodeKind::Element {
        return false;
    }

    // a label pointing at another control would compete with that control
    if node.tag == "label" && node.has_attr("for") {
        return false;
    }

    if node.inert || node.aria_hidden {
        return false;
    }

    if !node.bounds.is_some_and(|b| b.is_usable()) {
        return false;
    }

    if node.tag == "label" {
        return true;
    }

    has_interactive_tag(node) || has_interactive_role(node) || node.cursor_pointer
}

fn has_interactive_tag(node: &DomNode) -> bool {
    match node.tag.as_str() {
        "a" => node.has_attr("href"),
        "input" => node.attr("type") != Some("hidden"),
        tag => INTERACTIVE_TAGS.contains(tag) || node.attr("contenteditable").is_some_and(|v| v != "false"),
    }
}

fn has_interactive_role(node: &DomNode) -> bool {
    let ax_role = node.role.as_deref().filter(|r| INTERACTIVE_ROLES.contains(*r));
    let aria_role = node.attr("role").filter(|r| INTERACTIVE_ROLES.contains(*r));
    ax_role.is_some() || aria_role.is_some()
}
