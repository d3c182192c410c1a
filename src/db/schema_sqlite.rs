// SQLite keeps INTEGER keys as 64-bit rowids and timestamps as RFC 3339 text.

diesel::table! {
    users (id) {
        id -> BigInt,
        email -> Text,
        username -> Text,
        first_name -> Nullable<Text>,
        last_name -> Nullable<Text>,
        hashed_password -> Text,
        tenant_id -> Text,
        is_active -> Bool,
        is_verified -> Bool,
        is_superuser -> Bool,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    roles (id) {
        id -> BigInt,
        name -> Text,
        description -> Nullable<Text>,
        permissions -> Text,
        is_system_role -> Bool,
        is_active -> Bool,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    user_roles (user_id, role_id) {
        user_id -> BigInt,
        role_id -> BigInt,
    }
}

diesel::joinable!(user_roles -> users (user_id));
diesel::joinable!(user_roles -> roles (role_id));

diesel::allow_tables_to_appear_in_same_query!(users, roles, user_roles);
