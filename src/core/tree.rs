//! Branching conversation history.
//!
//! Messages live in an arena keyed by [`MessageId`]; parent and child links are
//! identifier relations. Every node with children remembers exactly one active
//! child, and the chain of active children starting at the active root is the
//! active path that gets sent to a provider.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};
use crate::core::message::{Message, MessageId, ProviderMeta, Role};

#[derive(Debug, Clone)]
struct Node {
    message: Message,
    children: Vec<MessageId>,
    active_child: Option<MessageId>,
}

impl Node {
    fn new(message: Message) -> Self {
        Self {
            message,
            children: Vec::new(),
            active_child: None,
        }
    }
}

/// A tree shared between the service and the generations running on it.
pub type SharedTree = std::sync::Arc<tokio::sync::Mutex<ConversationTree>>;

#[derive(Debug, Clone, Default)]
pub struct ConversationTree {
    nodes: HashMap<MessageId, Node>,
    roots: Vec<MessageId>,
    active_root: Option<MessageId>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.nodes.get(id).map(|node| &node.message)
    }

    pub fn roots(&self) -> &[MessageId] {
        &self.roots
    }

    pub fn active_root(&self) -> Option<MessageId> {
        self.active_root
    }

    /// Children of `id` in creation order.
    pub fn children(&self, id: &MessageId) -> Result<&[MessageId]> {
        Ok(&self.node(id)?.children)
    }

    pub fn active_child(&self, id: &MessageId) -> Result<Option<MessageId>> {
        Ok(self.node(id)?.active_child)
    }

    /// All alternatives at the branch point holding `id`, `id` included.
    /// For a root this is the list of roots.
    pub fn siblings(&self, id: &MessageId) -> Result<Vec<MessageId>> {
        let node = self.node(id)?;
        match node.message.parent {
            Some(parent) => Ok(self.node(&parent)?.children.clone()),
            None => Ok(self.roots.clone()),
        }
    }

    /// Zero-based index of `id` among its siblings and the sibling count.
    pub fn sibling_position(&self, id: &MessageId) -> Result<(usize, usize)> {
        let siblings = self.siblings(id)?;
        let index = siblings
            .iter()
            .position(|sibling| sibling == id)
            .ok_or_else(|| Error::InvalidState(format!("message {id} missing from its parent")))?;
        Ok((index, siblings.len()))
    }

    /// Start a new conversation root. Only system and user messages may be
    /// roots; the new root becomes the active one.
    pub fn add_root(&mut self, role: Role, content: impl Into<String>) -> Result<Message> {
        if role.is_assistant() {
            return Err(Error::InvalidState(
                "assistant messages cannot be conversation roots".to_string(),
            ));
        }

        let message = Message::new(None, role, content, None);
        let id = message.id;
        self.nodes.insert(id, Node::new(message.clone()));
        self.roots.push(id);
        self.activate(id)?;
        Ok(message)
    }

    /// Append a message under `parent`. The new message becomes the active
    /// child of its parent and the leaf of the active path.
    pub fn append_message(
        &mut self,
        parent: MessageId,
        role: Role,
        content: impl Into<String>,
        provider: Option<ProviderMeta>,
    ) -> Result<Message> {
        if !self.nodes.contains_key(&parent) {
            return Err(Error::message_not_found(parent));
        }

        let message = Message::new(Some(parent), role, content, provider);
        let id = message.id;
        self.nodes.insert(id, Node::new(message.clone()));
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.push(id);
        }
        self.activate(id)?;
        Ok(message)
    }

    /// Mark `id` active among its siblings and bring it onto the active path.
    /// Descendants keep their own active markers, so the path continues to
    /// the deepest previously selected leaf below `id`.
    pub fn select_branch(&mut self, id: MessageId) -> Result<()> {
        if !self.nodes.contains_key(&id) {
            return Err(Error::message_not_found(id));
        }
        self.activate(id)
    }

    /// Parent under which a regenerated sibling of `id` will be attached.
    pub fn regeneration_parent(&self, id: &MessageId) -> Result<MessageId> {
        let node = self.node(id)?;
        if !node.message.is_assistant() {
            return Err(Error::InvalidState(format!(
                "only assistant messages can be regenerated, {id} is a {} message",
                node.message.role
            )));
        }
        node.message.parent.ok_or_else(|| {
            Error::InvalidState(format!("root message {id} cannot be regenerated"))
        })
    }

    /// Add a regenerated assistant reply as a new sibling of `id`. The
    /// original stays in place and remains reachable through
    /// [`select_branch`](Self::select_branch).
    pub fn regenerate(
        &mut self,
        id: MessageId,
        content: impl Into<String>,
        provider: Option<ProviderMeta>,
    ) -> Result<Message> {
        let parent = self.regeneration_parent(&id)?;
        self.append_message(parent, Role::Assistant, content, provider)
    }

    /// Create an edited copy of `id` as a new sibling with the same role.
    /// Editing a root starts a new root.
    pub fn edit(&mut self, id: MessageId, content: impl Into<String>) -> Result<Message> {
        let message = self
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::message_not_found(id))?;
        match message.parent {
            Some(parent) => self.append_message(parent, message.role, content, None),
            None => self.add_root(message.role, content),
        }
    }

    /// Messages from the active root following active markers. With
    /// `leaf_hint` the path runs from the root down to that message instead.
    pub fn active_path(&self, leaf_hint: Option<MessageId>) -> Result<Vec<Message>> {
        if let Some(leaf) = leaf_hint {
            return self.path_to(leaf);
        }

        let mut path = Vec::new();
        let mut cursor = self.active_root;
        while let Some(id) = cursor {
            let node = self.node(&id)?;
            path.push(node.message.clone());
            cursor = node.active_child;
        }
        Ok(path)
    }

    /// Deepest message on the active path.
    pub fn active_leaf(&self) -> Option<MessageId> {
        let mut cursor = self.active_root?;
        while let Some(next) = self.nodes.get(&cursor).and_then(|node| node.active_child) {
            cursor = next;
        }
        Some(cursor)
    }

    /// Remove `id` together with all of its descendants, returning the removed
    /// identifiers. When the removed message was its parent's active child the
    /// newest surviving sibling takes over; without siblings the parent becomes
    /// a leaf.
    pub fn delete_subtree(&mut self, id: MessageId) -> Result<Vec<MessageId>> {
        let parent = self.node(&id)?.message.parent;

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
                removed.push(current);
            }
        }

        match parent {
            Some(parent) => {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.retain(|child| *child != id);
                    if parent_node.active_child == Some(id) {
                        parent_node.active_child = parent_node.children.last().copied();
                    }
                }
            }
            None => {
                self.roots.retain(|root| *root != id);
                if self.active_root == Some(id) {
                    self.active_root = self.roots.last().copied();
                }
            }
        }

        Ok(removed)
    }

    /// Serializable view of the tree: every message in pre-order plus the
    /// active marker of each branch point.
    pub fn to_snapshot(&self) -> TreeSnapshot {
        let mut messages = Vec::with_capacity(self.nodes.len());
        let mut active_children = BTreeMap::new();
        let mut stack: Vec<MessageId> = self.roots.iter().rev().copied().collect();

        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            messages.push(node.message.clone());
            if let Some(active) = node.active_child {
                active_children.insert(id, active);
            }
            stack.extend(node.children.iter().rev().copied());
        }

        TreeSnapshot {
            version: TreeSnapshot::CURRENT_VERSION,
            messages,
            active_root: self.active_root,
            active_children,
        }
    }

    /// Rebuild a tree from a snapshot, validating its structure. Parents must
    /// precede their children; branch points without a recorded active child
    /// default to their newest child.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self> {
        let mut tree = ConversationTree::new();

        for message in snapshot.messages {
            let id = message.id;
            if tree.nodes.contains_key(&id) {
                return Err(Error::InvalidState(format!(
                    "snapshot contains message {id} twice"
                )));
            }
            match message.parent {
                Some(parent) => {
                    let parent_node = tree.nodes.get_mut(&parent).ok_or_else(|| {
                        Error::InvalidState(format!(
                            "snapshot message {id} references unknown parent {parent}"
                        ))
                    })?;
                    parent_node.children.push(id);
                }
                None => {
                    if message.is_assistant() {
                        return Err(Error::InvalidState(format!(
                            "snapshot root {id} is an assistant message"
                        )));
                    }
                    tree.roots.push(id);
                }
            }
            tree.nodes.insert(id, Node::new(message));
        }

        for (parent, child) in snapshot.active_children {
            let node = tree.nodes.get_mut(&parent).ok_or_else(|| {
                Error::InvalidState(format!("active marker for unknown message {parent}"))
            })?;
            if !node.children.contains(&child) {
                return Err(Error::InvalidState(format!(
                    "active child {child} is not a child of {parent}"
                )));
            }
            node.active_child = Some(child);
        }

        for node in tree.nodes.values_mut() {
            if node.active_child.is_none() {
                node.active_child = node.children.last().copied();
            }
        }

        tree.active_root = match snapshot.active_root {
            Some(root) if tree.roots.contains(&root) => Some(root),
            Some(root) => {
                return Err(Error::InvalidState(format!(
                    "active root {root} is not a root of the snapshot"
                )))
            }
            None => tree.roots.last().copied(),
        };

        Ok(tree)
    }

    fn node(&self, id: &MessageId) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| Error::message_not_found(id))
    }

    fn path_to(&self, leaf: MessageId) -> Result<Vec<Message>> {
        let mut path = Vec::new();
        let mut cursor = Some(leaf);
        while let Some(id) = cursor {
            let node = self.node(&id)?;
            path.push(node.message.clone());
            cursor = node.message.parent;
        }
        path.reverse();
        Ok(path)
    }

    /// Point every ancestor of `id` at the chain leading to it.
    fn activate(&mut self, id: MessageId) -> Result<()> {
        let mut current = id;
        loop {
            let parent = self.node(&current)?.message.parent;
            match parent {
                Some(parent) => {
                    let parent_node = self
                        .nodes
                        .get_mut(&parent)
                        .ok_or_else(|| Error::message_not_found(parent))?;
                    parent_node.active_child = Some(current);
                    current = parent;
                }
                None => {
                    self.active_root = Some(current);
                    return Ok(());
                }
            }
        }
    }
}

/// Lossless, serializable form of a [`ConversationTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    #[serde(default = "TreeSnapshot::default_version")]
    pub version: u32,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub active_root: Option<MessageId>,
    #[serde(default)]
    pub active_children: BTreeMap<MessageId, MessageId>,
}

impl TreeSnapshot {
    pub const CURRENT_VERSION: u32 = 1;

    fn default_version() -> u32 {
        Self::CURRENT_VERSION
    }
}

impl Default for TreeSnapshot {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            messages: Vec::new(),
            active_root: None,
            active_children: BTreeMap::new(),
        }
    }
}
