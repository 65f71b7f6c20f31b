//! Recursive transforms over a post's comment forest.
//!
//! Root comments are kept newest first, replies inside a thread oldest first.
//! Every operation preserves that order and leaves untouched nodes as they were.

use crate::model::comment::{Comment, CommentId};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// A reply whose parent is not part of the locally held forest.
///
/// The comment is handed back so the caller can decide what to do with it.
#[derive(Clone, Eq, PartialEq, Debug, Error)]
#[error("No comment {parent} to attach reply {} to", .reply.id)]
pub struct OrphanedReply {
    pub parent: CommentId,
    pub reply: Comment,
}

#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct CommentForest(Vec<Comment>);

impl CommentForest {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Builds a forest from the flat rows a query returns.
    ///
    /// Rows whose parent is missing from the batch are dropped.
    #[must_use]
    pub fn from_flat(mut rows: Vec<Comment>) -> Self {
        fn adopt(node: &mut Comment, children: &mut HashMap<CommentId, Vec<Comment>>) {
            if let Some(mut replies) = children.remove(&node.id) {
                for reply in &mut replies {
                    adopt(reply, children);
                }
                node.replies.extend(replies);
            }
        }

        rows.sort_by_key(|row| row.created_at);

        let mut roots = Vec::new();
        let mut children: HashMap<CommentId, Vec<Comment>> = HashMap::new();
        for row in rows {
            match row.parent_id {
                None => roots.push(row),
                Some(parent) => children.entry(parent).or_default().push(row),
            }
        }

        for root in &mut roots {
            adopt(root, &mut children);
        }
        roots.reverse();

        let orphans: usize = children.values().map(Vec::len).sum();
        if orphans > 0 {
            debug!(orphans, "Dropping comments whose parent was not fetched");
        }

        Self(roots)
    }

    #[must_use]
    pub fn roots(&self) -> &[Comment] {
        &self.0
    }

    #[must_use]
    pub fn into_roots(self) -> Vec<Comment> {
        self.0
    }

    /// Number of comments at every depth.
    #[must_use]
    pub fn len(&self) -> usize {
        fn count(nodes: &[Comment]) -> usize {
            nodes.iter().map(|node| 1 + count(&node.replies)).sum()
        }

        count(&self.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn find(&self, id: CommentId) -> Option<&Comment> {
        fn find_in(nodes: &[Comment], id: CommentId) -> Option<&Comment> {
            nodes.iter().find_map(|node| {
                if node.id == id {
                    Some(node)
                } else {
                    find_in(&node.replies, id)
                }
            })
        }

        find_in(&self.0, id)
    }

    /// Inserts a root comment at the front or appends a reply to its parent.
    pub fn insert(&mut self, comment: Comment) -> Result<(), OrphanedReply> {
        fn attach(nodes: &mut [Comment], parent: CommentId, reply: Comment) -> Result<(), Comment> {
            let mut reply = reply;
            for node in nodes {
                if node.id == parent {
                    node.replies.push(reply);
                    return Ok(());
                }
                match attach(&mut node.replies, parent, reply) {
                    Ok(()) => return Ok(()),
                    Err(unattached) => reply = unattached,
                }
            }
            Err(reply)
        }

        match comment.parent_id {
            None => {
                self.0.insert(0, comment);
                Ok(())
            }
            Some(parent) => {
                attach(&mut self.0, parent, comment).map_err(|reply| OrphanedReply { parent, reply })
            }
        }
    }

    /// Removes the comment and its whole reply subtree. Returns whether
    /// anything was removed.
    pub fn remove(&mut self, id: CommentId) -> bool {
        fn remove_from(nodes: &mut Vec<Comment>, id: CommentId) -> bool {
            let before = nodes.len();
            nodes.retain(|node| node.id != id);
            let mut removed = nodes.len() != before;
            for node in nodes.iter_mut() {
                removed |= remove_from(&mut node.replies, id);
            }
            removed
        }

        remove_from(&mut self.0, id)
    }

    /// Replaces the content of one comment, leaving every other field alone.
    pub fn edit(&mut self, id: CommentId, content: &str) -> bool {
        self.update_where(id, |comment| content.clone_into(&mut comment.content))
    }

    /// Applies `update` to the comment with `id`, wherever it sits.
    pub fn update_where(&mut self, id: CommentId, update: impl FnOnce(&mut Comment)) -> bool {
        fn find_mut(nodes: &mut [Comment], id: CommentId) -> Option<&mut Comment> {
            nodes.iter_mut().find_map(|node| {
                if node.id == id {
                    Some(node)
                } else {
                    find_mut(&mut node.replies, id)
                }
            })
        }

        match find_mut(&mut self.0, id) {
            Some(comment) => {
                update(comment);
                true
            }
            None => false,
        }
    }
}

impl From<Vec<Comment>> for CommentForest {
    fn from(roots: Vec<Comment>) -> Self {
        Self(roots)
    }
}
