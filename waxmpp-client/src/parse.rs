//! Reply-node parsing helpers shared by the API surface and the dispatch
//! loop.

use chrono::{TimeZone, Utc};
use waxmpp_codec::Node;

use crate::events::{GroupInfo, LastSeen, SyncResult, UserStatus};

pub(crate) fn statuses(node: &Node) -> Vec<UserStatus> {
    let Some(status) = node.child("status") else {
        return Vec::new();
    };
    status
        .children()
        .iter()
        .filter(|c| c.tag() == "user")
        .map(|user| UserStatus {
            jid: user.attribute("jid").unwrap_or_default().to_string(),
            status: user.data_string().unwrap_or_default(),
            set_at: user
                .attribute("t")
                .and_then(|t| t.parse::<i64>().ok())
                .and_then(|t| Utc.timestamp_opt(t, 0).single()),
        })
        .collect()
}

pub(crate) fn group_info(group: &Node) -> GroupInfo {
    GroupInfo {
        jid: group
            .attribute("id")
            .or_else(|| group.attribute("jid"))
            .unwrap_or_default()
            .to_string(),
        owner: group.attribute("owner").map(str::to_string),
        subject: group.attribute("subject").map(str::to_string),
        creation: group.attribute("creation").and_then(|c| c.parse().ok()),
        participants: group
            .children()
            .iter()
            .filter(|c| c.tag() == "participant")
            .filter_map(|p| p.attribute("jid").map(str::to_string))
            .collect(),
    }
}

pub(crate) fn sync_result(node: &Node) -> SyncResult {
    fn user_list(container: Option<&Node>) -> Vec<String> {
        container
            .map(|c| {
                c.children()
                    .iter()
                    .filter(|u| u.tag() == "user")
                    .map(|u| {
                        u.attribute("jid")
                            .map(str::to_string)
                            .or_else(|| u.data_string())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    let sync = node.child("sync");
    SyncResult {
        existing: user_list(sync.and_then(|s| s.child("in"))),
        non_existing: user_list(sync.and_then(|s| s.child("out"))),
        invalid: user_list(sync.and_then(|s| s.child("invalid"))),
    }
}

pub(crate) fn last_seen(node: &Node) -> Option<LastSeen> {
    let seconds_ago: u64 = node.child("query")?.attribute("seconds")?.parse().ok()?;
    Some(LastSeen {
        from: node.attribute("from").unwrap_or_default().to_string(),
        seconds_ago,
        date: Utc::now() - chrono::Duration::seconds(seconds_ago as i64),
    })
}

/// Flatten `<container><item name=… value=…/>…</container>` into pairs.
pub(crate) fn named_pairs(node: &Node, container: &str, item: &str) -> Vec<(String, String)> {
    let Some(container) = node.child(container) else {
        return Vec::new();
    };
    container
        .children()
        .iter()
        .filter(|c| c.tag() == item)
        .map(|c| {
            (
                c.attribute("name").unwrap_or_default().to_string(),
                c.attribute("value").unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_result_splits_buckets() {
        let node = Node::new("iq").with_child(
            Node::new("sync")
                .with_child(
                    Node::new("in")
                        .with_child(Node::new("user").with_attribute("jid", "a@s.whatsapp.net")),
                )
                .with_child(Node::new("out").with_child(Node::new("user").with_data(&b"+3161"[..])))
                .with_child(
                    Node::new("invalid").with_child(Node::new("user").with_data(&b"junk"[..])),
                ),
        );
        let result = sync_result(&node);
        assert_eq!(result.existing, ["a@s.whatsapp.net"]);
        assert_eq!(result.non_existing, ["+3161"]);
        assert_eq!(result.invalid, ["junk"]);
    }

    #[test]
    fn group_info_collects_participants() {
        let group = Node::new("group")
            .with_attribute("id", "123-456")
            .with_attribute("owner", "123@s.whatsapp.net")
            .with_attribute("subject", "holiday")
            .with_attribute("creation", "1700000000")
            .with_child(Node::new("participant").with_attribute("jid", "a@s.whatsapp.net"))
            .with_child(Node::new("participant").with_attribute("jid", "b@s.whatsapp.net"));
        let info = group_info(&group);
        assert_eq!(info.jid, "123-456");
        assert_eq!(info.subject.as_deref(), Some("holiday"));
        assert_eq!(info.participants.len(), 2);
    }

    #[test]
    fn last_seen_needs_seconds() {
        let ok = Node::new("iq")
            .with_attribute("from", "a@s.whatsapp.net")
            .with_child(Node::new("query").with_attribute("seconds", "120"));
        assert_eq!(last_seen(&ok).unwrap().seconds_ago, 120);

        let missing = Node::new("iq").with_child(Node::new("query"));
        assert!(last_seen(&missing).is_none());
    }
}
