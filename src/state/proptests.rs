//! Property tests for state keying

use super::StateScope;
use crate::activity::{Activity, ChannelAccount, ConversationAccount};
use proptest::prelude::*;

fn id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9:_-]{1,16}"
}

fn activity(channel: &str, conversation: &str, user: &str, text: &str) -> Activity {
    Activity {
        channel_id: channel.to_string(),
        conversation: Some(ConversationAccount::new(conversation)),
        from: Some(ChannelAccount::new(user)),
        ..Activity::message(text)
    }
}

proptest! {
    #[test]
    fn keys_depend_only_on_ids(
        channel in id(),
        conversation in id(),
        user in id(),
        text_a in ".*",
        text_b in ".*",
    ) {
        let a = activity(&channel, &conversation, &user, &text_a);
        let b = activity(&channel, &conversation, &user, &text_b);
        for scope in [StateScope::Conversation, StateScope::User, StateScope::PrivateConversation] {
            prop_assert_eq!(scope.storage_key(&a).unwrap(), scope.storage_key(&b).unwrap());
        }
    }

    #[test]
    fn scopes_never_share_keys(channel in id(), conversation in id(), user in id()) {
        let a = activity(&channel, &conversation, &user, "x");
        let conv = StateScope::Conversation.storage_key(&a).unwrap();
        let usr = StateScope::User.storage_key(&a).unwrap();
        let private = StateScope::PrivateConversation.storage_key(&a).unwrap();
        prop_assert_ne!(&conv, &usr);
        prop_assert_ne!(&conv, &private);
        prop_assert_ne!(&usr, &private);
        prop_assert!(private.starts_with(&conv));
    }
}
