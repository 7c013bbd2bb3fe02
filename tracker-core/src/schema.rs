use diesel::{allow_tables_to_appear_in_same_query, joinable, table};

table! {
    tracked_emails (id) {
        id -> Uuid,
        user_id -> Text,
        sender_address -> Text,
        recipient_address -> Text,
        subject -> Text,
        provider_message_id -> Nullable<Text>,
        conversation_id -> Nullable<Text>,
        internet_message_id -> Nullable<Text>,
        sent_at -> Timestamptz,
        expires_at -> Nullable<Timestamptz>,
        status -> Text,
        reply_received_at -> Nullable<Timestamptz>,
        reply_method -> Nullable<Text>,
        stopped_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    incoming_messages (id) {
        id -> BigInt,
        user_id -> Text,
        provider_message_id -> Text,
        conversation_id -> Nullable<Text>,
        internet_message_id -> Nullable<Text>,
        in_reply_to -> Nullable<Text>,
        sender_address -> Text,
        recipient_address -> Text,
        subject -> Text,
        received_at -> Timestamptz,
        body_preview -> Text,
        is_read -> Bool,
        created_at -> Timestamptz,
    }
}

table! {
    webhook_subscriptions (subscription_id) {
        subscription_id -> Text,
        user_id -> Text,
        resource -> Text,
        change_types -> Text,
        expires_at -> Timestamptz,
        status -> Text,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    tracking_events (id) {
        id -> BigInt,
        tracked_email_id -> Nullable<Uuid>,
        user_id -> Nullable<Text>,
        event_type -> Text,
        detail -> Jsonb,
        created_at -> Timestamptz,
    }
}

table! {
    oauth_tokens (user_id) {
        user_id -> Text,
        email -> Text,
        access_token -> Text,
        expires_at -> Timestamptz,
    }
}

joinable!(tracking_events -> tracked_emails (tracked_email_id));

allow_tables_to_appear_in_same_query!(
    tracked_emails,
    incoming_messages,
    webhook_subscriptions,
    tracking_events,
    oauth_tokens,
);
