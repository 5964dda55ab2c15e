/// Longest topic name or filter that fits a length prefixed mqtt string
pub const MAX_TOPIC_LEN: usize = 65535;

/// Checks if a topic or topic filter has wildcards
pub fn has_wildcards(s: &str) -> bool {
    s.contains(['+', '#'])
}

/// Rules shared by topic names and filters: non empty, no nul character
/// and short enough to be written as an mqtt string
fn well_formed(s: &str) -> bool {
    !s.is_empty() && s.len() <= MAX_TOPIC_LEN && !s.contains('\0')
}

/// Checks if a topic is valid for a PUBLISH or a will
pub fn valid_topic(topic: &str) -> bool {
    well_formed(topic) && !has_wildcards(topic)
}

/// Checks if the filter is valid for a SUBSCRIBE or UNSUBSCRIBE
///
/// `+` has to occupy a whole level and `#` is only allowed as the whole of
/// the last level
///
/// <https://docs.oasis-open.org/mqtt/mqtt/v3.1.1/os/mqtt-v3.1.1-os.html#_Toc398718106>
pub fn valid_filter(filter: &str) -> bool {
    if !well_formed(filter) {
        return false;
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.len() > 1 && has_wildcards(level) {
            return false;
        }

        if *level == "#" && i != last {
            return false;
        }
    }

    true
}

/// Checks if topic matches a filter. Neither is validated here
pub fn matches(topic: &str, filter: &str) -> bool {
    // $SYS style topics are never matched by wildcards at the first level
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topics = topic.split('/');
    let mut filters = filter.split('/');

    loop {
        match (filters.next(), topics.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wildcards_are_detected() {
        assert!(has_wildcards("a/b/#"));
        assert!(has_wildcards("a/+/b"));
        assert!(!has_wildcards("a/b/c"));
    }

    #[test]
    fn topics_are_validated() {
        assert!(valid_topic("t"));
        assert!(valid_topic("/"));
        assert!(valid_topic("hello/world "));
        assert!(!valid_topic(""));
        assert!(!valid_topic("hello/+/world"));
        assert!(!valid_topic("hello/#"));
        assert!(!valid_topic("null\0char"));
        assert!(!valid_topic(&"a".repeat(MAX_TOPIC_LEN + 1)));
    }

    #[test]
    fn filters_are_validated() {
        assert!(valid_filter("#"));
        assert!(valid_filter("+"));
        assert!(valid_filter("sport/+/player1"));
        assert!(valid_filter("sport/tennis/#"));
        assert!(valid_filter("+/+/#"));
        assert!(!valid_filter(""));
        assert!(!valid_filter("sport/tennis#"));
        assert!(!valid_filter("sport/tennis/#/ranking"));
        assert!(!valid_filter("sport+"));
        assert!(!valid_filter("sport/++"));
    }

    #[test]
    fn filters_match_topics() {
        assert!(matches("t", "t"));
        assert!(matches("a/b/c", "a/+/c"));
        assert!(matches("a/b/c", "a/#"));
        assert!(matches("a", "a/#"));
        assert!(matches("a/b/c", "#"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/+"));
        assert!(!matches("$SYS/uptime", "#"));
        assert!(!matches("$SYS/uptime", "+/uptime"));
        assert!(matches("$SYS/uptime", "$SYS/#"));
    }
}
