use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::parser::utils::escape_html;

/// Document生成用カウンター（複数ページを同時に扱う場合の識別用）
static DOCUMENT_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// ノードID（Documentのアリーナ内インデックス）
pub type NodeId = usize;

/// 子要素を持たないHTML要素
const VOID_TAGS: &[&str] = &["area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr"];

#[derive(Debug, Clone)]
pub enum NodeKind {
    Element {
        tag: String,
        attributes: Vec<(String, String)>,
    },
    Text(String),
}

/// メディア要素（video）の再生状態
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaState {
    pub playing: bool,
    pub current_time: f64,
}

/// 属性では表現されないノードの実行時状態
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeState {
    pub hidden: bool,
    pub disabled: bool,
    pub media: MediaState,
    pub reload_count: u32,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub state: NodeState,
}

/// 属性セレクタの条件
#[derive(Debug, Clone, PartialEq)]
pub enum AttrMatch {
    /// [name]
    Present(String),
    /// [name="value"]
    Equals(String, String),
}

impl AttrMatch {
    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        match self {
            AttrMatch::Present(name) => doc.has_attribute(node, name),
            AttrMatch::Equals(name, value) => doc.attribute(node, name) == Some(value.as_str()),
        }
    }
}

/// CSSセレクタの最小サブセット: tag[attr][attr=value]:not([attr])
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub tag: Option<String>,
    pub attrs: Vec<AttrMatch>,
    pub not: Vec<AttrMatch>,
}

impl Selector {
    pub fn tag(tag: &str) -> Self {
        Self {
            tag: Some(tag.to_ascii_lowercase()),
            ..Default::default()
        }
    }

    pub fn attr(name: &str) -> Self {
        Self::default().with_attr(name)
    }

    pub fn attr_eq(name: &str, value: &str) -> Self {
        Self::default().with_attr_eq(name, value)
    }

    pub fn with_attr(mut self, name: &str) -> Self {
        self.attrs.push(AttrMatch::Present(name.to_string()));
        self
    }

    pub fn with_attr_eq(mut self, name: &str, value: &str) -> Self {
        self.attrs.push(AttrMatch::Equals(name.to_string(), value.to_string()));
        self
    }

    pub fn without_attr(mut self, name: &str) -> Self {
        self.not.push(AttrMatch::Present(name.to_string()));
        self
    }

    pub fn without_attr_eq(mut self, name: &str, value: &str) -> Self {
        self.not.push(AttrMatch::Equals(name.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        let Some(tag) = doc.tag(node) else {
            return false;
        };
        if let Some(expected) = &self.tag {
            if expected != tag {
                return false;
            }
        }
        self.attrs.iter().all(|m| m.matches(doc, node)) && !self.not.iter().any(|m| m.matches(doc, node))
    }
}

/// ページのドキュメントツリー
/// ブラウザDOMの代わりに、属性でアドレスされるノードをアリーナで保持する
#[derive(Debug, Clone)]
pub struct Document {
    id: usize,
    nodes: Vec<Node>,
    root: NodeId,
    /// 解放済みで再利用できるスロット
    free: Vec<NodeId>,
    focused: Option<NodeId>,
    scroll_target: Option<NodeId>,
    selection: Option<NodeId>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// 空のドキュメントを作成（ルートは "#document" 要素）
    pub fn new() -> Self {
        let root = Node {
            kind: NodeKind::Element {
                tag: "#document".to_string(),
                attributes: Vec::new(),
            },
            parent: None,
            children: Vec::new(),
            state: NodeState::default(),
        };
        Self {
            id: DOCUMENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            nodes: vec![root],
            root: 0,
            free: Vec::new(),
            focused: None,
            scroll_target: None,
            selection: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push_node(NodeKind::Element {
            tag: tag.to_ascii_lowercase(),
            attributes: Vec::new(),
        })
    }

    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push_node(NodeKind::Text(text.to_string()))
    }

    fn push_node(&mut self, kind: NodeKind) -> NodeId {
        let node = Node {
            kind,
            parent: None,
            children: Vec::new(),
            state: NodeState::default(),
        };
        if let Some(id) = self.free.pop() {
            self.nodes[id] = node;
            return id;
        }
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// アリーナのスロット数（解放済みを含む）
    pub fn slot_count(&self) -> usize {
        self.nodes.len()
    }

    /// 使用中のノード数
    pub fn live_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// サブツリーを切り離してスロットを解放し、解放したIDを返す
    /// 解放後のIDは別のノードに再利用されるため、呼び出し側は保持しているIDを捨てること
    pub fn remove_subtree(&mut self, node: NodeId) -> Vec<NodeId> {
        if node == self.root || node >= self.nodes.len() || self.free.contains(&node) {
            return Vec::new();
        }
        self.detach(node);

        let mut removed = vec![node];
        let mut i = 0;
        while i < removed.len() {
            let children = self.nodes[removed[i]].children.clone();
            removed.extend(children);
            i += 1;
        }

        for &id in &removed {
            self.nodes[id] = Node {
                kind: NodeKind::Text(String::new()),
                parent: None,
                children: Vec::new(),
                state: NodeState::default(),
            };
        }
        for slot in [&mut self.focused, &mut self.scroll_target, &mut self.selection] {
            if slot.is_some_and(|id| removed.contains(&id)) {
                *slot = None;
            }
        }
        self.free.extend(removed.iter().rev().copied());
        removed
    }

    /// 子ノードを末尾に追加（既に親がある場合は付け替え）
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.push(child);
        }
        if let Some(c) = self.nodes.get_mut(child) {
            c.parent = Some(parent);
        }
    }

    /// 親から切り離す
    pub fn detach(&mut self, node: NodeId) {
        let Some(parent) = self.nodes.get(node).and_then(|n| n.parent) else {
            return;
        };
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.retain(|&c| c != node);
        }
        if let Some(n) = self.nodes.get_mut(node) {
            n.parent = None;
        }
    }

    /// 子ノードを全て置き換える（innerHTML = "" + appendChild相当）
    /// 取り除かれたノードのIDを返す
    pub fn replace_children(&mut self, parent: NodeId, new_children: &[NodeId]) -> Vec<NodeId> {
        let old = self
            .nodes
            .get(parent)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        for &child in &old {
            if let Some(n) = self.nodes.get_mut(child) {
                n.parent = None;
            }
        }
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.clear();
        }
        for &child in new_children {
            self.append_child(parent, child);
        }
        old
    }

    /// サブツリーを深くコピーする（コピーは親を持たない）
    pub fn clone_subtree(&mut self, node: NodeId) -> NodeId {
        let Some(source) = self.nodes.get(node).cloned() else {
            return self.create_text("");
        };
        let copy = self.push_node(source.kind);
        if let Some(n) = self.nodes.get_mut(copy) {
            n.state = source.state;
        }
        for child in source.children {
            let child_copy = self.clone_subtree(child);
            self.append_child(copy, child_copy);
        }
        copy
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node).and_then(|n| n.parent)
    }

    /// 要素の子のみを返す（テキストノードは除外）
    pub fn element_children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node)
            .map(|n| {
                n.children
                    .iter()
                    .copied()
                    .filter(|&c| self.is_element(c))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        matches!(self.nodes.get(node).map(|n| &n.kind), Some(NodeKind::Element { .. }))
    }

    /// ドキュメントに接続されているか
    pub fn is_connected(&self, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(id) = current {
            if id == self.root {
                return true;
            }
            current = self.parent(id);
        }
        false
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        match self.nodes.get(node).map(|n| &n.kind) {
            Some(NodeKind::Element { tag, .. }) => Some(tag.as_str()),
            _ => None,
        }
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        match self.nodes.get(node).map(|n| &n.kind) {
            Some(NodeKind::Element { attributes, .. }) => attributes
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    pub fn has_attribute(&self, node: NodeId, name: &str) -> bool {
        self.attribute(node, name).is_some()
    }

    /// 全属性をマップとして取得（getAttributes相当）
    pub fn attributes(&self, node: NodeId) -> HashMap<String, String> {
        match self.nodes.get(node).map(|n| &n.kind) {
            Some(NodeKind::Element { attributes, .. }) => attributes.iter().cloned().collect(),
            _ => HashMap::new(),
        }
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        if let Some(Node {
            kind: NodeKind::Element { attributes, .. },
            ..
        }) = self.nodes.get_mut(node)
        {
            match attributes.iter_mut().find(|(k, _)| k == name) {
                Some((_, v)) => *v = value.to_string(),
                None => attributes.push((name.to_string(), value.to_string())),
            }
        }
    }

    // ========================================
    // クラス操作
    // ========================================

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.attribute(node, "class")
            .map(|c| c.split_whitespace().any(|x| x == class))
            .unwrap_or(false)
    }

    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if self.has_class(node, class) {
            return;
        }
        let classes = match self.attribute(node, "class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {}", existing.trim(), class),
            _ => class.to_string(),
        };
        self.set_attribute(node, "class", &classes);
    }

    pub fn remove_class(&mut self, node: NodeId, class: &str) {
        let Some(existing) = self.attribute(node, "class") else {
            return;
        };
        let classes: Vec<&str> = existing.split_whitespace().filter(|x| *x != class).collect();
        let joined = classes.join(" ");
        self.set_attribute(node, "class", &joined);
    }

    pub fn toggle_class(&mut self, node: NodeId, class: &str) {
        if self.has_class(node, class) {
            self.remove_class(node, class);
        } else {
            self.add_class(node, class);
        }
    }

    // ========================================
    // 検索
    // ========================================

    /// 子孫要素をドキュメント順で列挙（自身は含まない）
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_descendants(node, &mut out);
        out
    }

    fn collect_descendants(&self, node: NodeId, out: &mut Vec<NodeId>) {
        if let Some(n) = self.nodes.get(node) {
            for &child in &n.children {
                if self.is_element(child) {
                    out.push(child);
                    self.collect_descendants(child, out);
                }
            }
        }
    }

    /// querySelectorAll相当（セレクタリストのいずれかに一致）
    pub fn query_selector_all(&self, scope: NodeId, selectors: &[Selector]) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|&n| selectors.iter().any(|s| s.matches(self, n)))
            .collect()
    }

    pub fn query_selector(&self, scope: NodeId, selectors: &[Selector]) -> Option<NodeId> {
        self.query_selector_all(scope, selectors).into_iter().next()
    }

    /// closest相当（自身を含めて祖先を探索）
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(node);
        while let Some(id) = current {
            if selector.matches(self, id) {
                return Some(id);
            }
            current = self.parent(id);
        }
        None
    }

    /// 指定した属性値を持つ最初の要素
    pub fn find_by_attribute(&self, name: &str, value: &str) -> Option<NodeId> {
        self.query_selector(self.root, &[Selector::attr_eq(name, value)])
    }

    /// <head> を取得（なければ作成）
    pub fn head(&mut self) -> NodeId {
        if let Some(head) = self.query_selector(self.root, &[Selector::tag("head")]) {
            return head;
        }
        let head = self.create_element("head");
        let parent = self
            .query_selector(self.root, &[Selector::tag("html")])
            .unwrap_or(self.root);
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.insert(0, head);
        }
        if let Some(h) = self.nodes.get_mut(head) {
            h.parent = Some(parent);
        }
        head
    }

    // ========================================
    // フォーカス・スクロール・選択
    // ========================================

    pub fn focused(&self) -> Option<NodeId> {
        self.focused
    }

    pub fn set_focus(&mut self, node: Option<NodeId>) {
        self.focused = node;
    }

    pub fn scroll_target(&self) -> Option<NodeId> {
        self.scroll_target
    }

    pub fn scroll_into_view(&mut self, node: NodeId) {
        self.scroll_target = Some(node);
    }

    pub fn selection(&self) -> Option<NodeId> {
        self.selection
    }

    pub fn select(&mut self, node: NodeId) {
        self.selection = Some(node);
    }

    // ========================================
    // HTML出力
    // ========================================

    /// ノードの子をHTMLとして出力（innerHTML相当）
    pub fn inner_html(&self, node: NodeId) -> String {
        let mut html_buffer = Vec::new();
        self.write_children(node, &mut html_buffer);
        html_buffer.join("")
    }

    /// ノード自身を含めてHTMLとして出力（outerHTML相当）
    pub fn outer_html(&self, node: NodeId) -> String {
        let mut html_buffer = Vec::new();
        self.write_html(node, &mut html_buffer);
        html_buffer.join("")
    }

    /// ドキュメント全体のHTML
    pub fn to_html(&self) -> String {
        self.inner_html(self.root)
    }

    // script / style の中身はエスケープしない
    fn write_children(&self, node: NodeId, out: &mut Vec<String>) {
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        let raw = matches!(self.tag(node), Some("script") | Some("style"));
        for &child in &n.children {
            match self.nodes.get(child).map(|c| &c.kind) {
                Some(NodeKind::Text(text)) if raw => out.push(text.clone()),
                _ => self.write_html(child, out),
            }
        }
    }

    fn write_html(&self, node: NodeId, out: &mut Vec<String>) {
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        match &n.kind {
            NodeKind::Text(text) => out.push(escape_html(text, false)),
            NodeKind::Element { tag, attributes } => {
                let mut open = format!("<{}", tag);
                for (k, v) in attributes {
                    if k == "style" && n.state.hidden {
                        continue;
                    }
                    open.push_str(&format!(" {}=\"{}\"", k, escape_html(v, true)));
                }
                if n.state.hidden {
                    let style = attributes
                        .iter()
                        .find(|(k, _)| k == "style")
                        .map(|(_, v)| v.trim().trim_end_matches(';').to_string())
                        .filter(|s| !s.is_empty());
                    match style {
                        Some(s) => open.push_str(&format!(" style=\"{}; display: none\"", escape_html(&s, true))),
                        None => open.push_str(" style=\"display: none\""),
                    }
                }
                if n.state.disabled && !attributes.iter().any(|(k, _)| k == "disabled") {
                    open.push_str(" disabled");
                }
                open.push('>');
                out.push(open);

                if VOID_TAGS.contains(&tag.as_str()) {
                    return;
                }
                self.write_children(node, out);
                out.push(format!("</{}>", tag));
            }
        }
    }
}
