//! Message filtering: type whitelist and DevEui whitelist.
//!
//! A message passes when its type equals any allowed type (or the whitelist
//! contains the wildcard `*`) AND its DevEui matches at least one compiled
//! expression.  Messages that carry no DevEui at all (`dnacked`) are routed
//! by type alone.

use regex::Regex;

/// Why the filter rejected a message.  The pipeline counts rejections per
/// reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReject {
    TypeWhitelist,
    DevEuiWhitelist,
}

impl FilterReject {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReject::TypeWhitelist => "type_wl",
            FilterReject::DevEuiWhitelist => "deveui_wl",
        }
    }
}

/// Compiled filter rule set.  Immutable; SIGHUP swaps the whole set.
#[derive(Debug)]
pub struct FilterSet {
    msg_types: Vec<String>,
    wildcard: bool,
    deveui: Vec<Regex>,
}

impl FilterSet {
    /// Compile the rule strings.  An unparseable expression is a fatal
    /// configuration error.
    pub fn compile(msg_types: &[String], deveui: &[String]) -> Result<FilterSet, regex::Error> {
        let mut expressions = Vec::with_capacity(deveui.len());
        for expr in deveui {
            expressions.push(Regex::new(expr)?);
        }
        Ok(FilterSet {
            msg_types: msg_types.to_vec(),
            wildcard: msg_types.iter().any(|t| t == "*"),
            deveui: expressions,
        })
    }

    /// Evaluate a message against the rule set.
    pub fn evaluate(&self, msg_type: &str, dev_eui: Option<&str>) -> Result<(), FilterReject> {
        let type_ok = self.wildcard || self.msg_types.iter().any(|t| t == msg_type);
        if !type_ok {
            return Err(FilterReject::TypeWhitelist);
        }
        match dev_eui {
            None => Ok(()),
            Some(eui) => {
                if self.deveui.iter().any(|re| re.is_match(eui)) {
                    Ok(())
                } else {
                    Err(FilterReject::DevEuiWhitelist)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(types: &[&str], euis: &[&str]) -> FilterSet {
        let types: Vec<String> = types.iter().map(|s| s.to_string()).collect();
        let euis: Vec<String> = euis.iter().map(|s| s.to_string()).collect();
        FilterSet::compile(&types, &euis).expect("compile")
    }

    #[test]
    fn matching_type_and_deveui_passes() {
        let f = rules(&["updf"], &["^64-7F-.*"]);
        assert_eq!(f.evaluate("updf", Some("64-7F-DA-00-00-00-07-85")), Ok(()));
    }

    #[test]
    fn mismatched_deveui_is_rejected_with_deveui_reason() {
        let f = rules(&["updf"], &["^64-7F-.*"]);
        assert_eq!(
            f.evaluate("updf", Some("80-7B-85-90-20-00-05-5A")),
            Err(FilterReject::DevEuiWhitelist)
        );
    }

    #[test]
    fn unlisted_type_is_rejected_with_type_reason() {
        let f = rules(&["updf"], &["^64-7F-.*"]);
        assert_eq!(
            f.evaluate("dntxed", Some("64-7F-DA-00-00-00-07-85")),
            Err(FilterReject::TypeWhitelist)
        );
    }

    #[test]
    fn wildcard_admits_any_type() {
        let f = rules(&["*"], &["^64-7F-.*"]);
        assert_eq!(f.evaluate("dnclr", Some("64-7F-DA-00-00-00-07-85")), Ok(()));
    }

    #[test]
    fn message_without_deveui_is_routed_by_type_alone() {
        let f = rules(&["dnacked"], &["^64-7F-.*"]);
        assert_eq!(f.evaluate("dnacked", None), Ok(()));
    }

    #[test]
    fn empty_deveui_whitelist_rejects_identified_messages() {
        let f = rules(&["updf"], &[]);
        assert_eq!(
            f.evaluate("updf", Some("64-7F-DA-00-00-00-07-85")),
            Err(FilterReject::DevEuiWhitelist)
        );
    }

    #[test]
    fn bad_expression_fails_to_compile() {
        let types = vec!["updf".to_owned()];
        let euis = vec!["[".to_owned()];
        assert!(FilterSet::compile(&types, &euis).is_err());
    }
}
