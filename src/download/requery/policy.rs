/// Rule deciding whether a broadcast requery may go out right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Broadcast requeries never go out.
    Disabled,
    /// One broadcast requery, after the user activated requerying.
    AfterActivate,
}

impl SendPolicy {
    /// `Disabled` unless the crate is built with the `active-requery` feature.
    pub const fn build_default() -> Self {
        if cfg!(feature = "active-requery") {
            Self::AfterActivate
        } else {
            Self::Disabled
        }
    }

    pub fn allows(self, activated: bool, sent_broadcast: bool) -> bool {
        match self {
            Self::Disabled => false,
            Self::AfterActivate => activated && !sent_broadcast,
        }
    }
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self::build_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_policy_never_allows() {
        for activated in [false, true] {
            for sent in [false, true] {
                assert!(!SendPolicy::Disabled.allows(activated, sent));
            }
        }
    }

    #[test]
    fn after_activate_requires_activation_and_unsent_broadcast() {
        let p = SendPolicy::AfterActivate;
        assert!(!p.allows(false, false));
        assert!(p.allows(true, false));
        assert!(!p.allows(true, true));
        assert!(!p.allows(false, true));
    }

    #[cfg(not(feature = "active-requery"))]
    #[test]
    fn default_build_keeps_broadcast_requery_disabled() {
        assert_eq!(SendPolicy::default(), SendPolicy::Disabled);
    }
}
