//! JID helpers.
//!
//! Users are `<digits>@s.whatsapp.net`, groups `<digits>-<digits>@g.us`.

/// Default user host.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Default group host.
pub const GROUP_SERVER: &str = "g.us";

/// Turn a bare msisdn into a user JID; full JIDs pass through unchanged.
pub fn to_user_jid(who: &str, server: &str) -> String {
    if who.contains('@') {
        who.to_string()
    } else {
        format!("{who}@{server}")
    }
}

/// Turn a bare group id into a group JID; full JIDs pass through unchanged.
pub fn to_group_jid(group: &str, group_server: &str) -> String {
    if group.contains('@') {
        group.to_string()
    } else {
        format!("{group}@{group_server}")
    }
}

/// The part before `@`, or the whole string for bare ids.
pub fn local_part(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// `true` for `…@g.us` style addresses.
pub fn is_group(jid: &str) -> bool {
    jid.ends_with("@g.us") || local_part(jid).contains('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_msisdn_gets_server() {
        assert_eq!(
            to_user_jid("31000000000", USER_SERVER),
            "31000000000@s.whatsapp.net"
        );
    }

    #[test]
    fn full_jid_passes_through() {
        assert_eq!(
            to_user_jid("31000000000@s.whatsapp.net", USER_SERVER),
            "31000000000@s.whatsapp.net"
        );
    }

    #[test]
    fn group_detection() {
        assert!(is_group("31000000000-1400000000@g.us"));
        assert!(!is_group("31000000000@s.whatsapp.net"));
    }
}
