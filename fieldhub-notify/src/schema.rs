// Tables are owned by the main application schema; only the columns read or
// written here are declared.

diesel::table! {
    message_notifications (id) {
        id -> Uuid,
        recipient_id -> Uuid,
        message_id -> Uuid,
        sender_id -> Uuid,
        viewed -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    messages (id) {
        id -> Uuid,
        thread_id -> Uuid,
        sender_id -> Uuid,
        content -> Text,
        sent_at -> Timestamptz,
    }
}

diesel::table! {
    profiles (id) {
        id -> Uuid,
        #[max_length = 255]
        full_name -> Varchar,
        avatar_url -> Nullable<Text>,
        #[max_length = 50]
        role -> Nullable<Varchar>,
    }
}

diesel::joinable!(message_notifications -> messages (message_id));
diesel::joinable!(messages -> profiles (sender_id));

diesel::allow_tables_to_appear_in_same_query!(
    message_notifications,
    messages,
    profiles,
);
