//! Esquema Diesel (escrito a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    job_records (session_id, job_id) {
        session_id -> Text,
        job_id -> Text,
        created_at -> Timestamptz,
        meta -> Jsonb,
        params -> Nullable<Jsonb>,
        status -> Text,
        status_doc -> Jsonb,
        updated_at -> Timestamptz,
        output -> Nullable<Jsonb>,
    }
}

diesel::table! {
    job_progress (seq) {
        seq -> BigInt,
        session_id -> Text,
        job_id -> Text,
        attempt -> Integer,
        at -> Timestamptz,
        details -> Jsonb,
    }
}

diesel::table! {
    job_outputs (seq) {
        seq -> BigInt,
        session_id -> Text,
        job_id -> Text,
        written_at -> Timestamptz,
        output -> Jsonb,
    }
}

diesel::table! {
    notification_history (seq) {
        seq -> BigInt,
        session_id -> Text,
        job_id -> Text,
        channel -> Text,
        status -> Text,
        ts -> Timestamptz,
        event -> Jsonb,
    }
}

diesel::table! {
    dispatch_claims (job_id) {
        job_id -> Text,
        session_id -> Text,
        claimed_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    job_records,
    job_progress,
    job_outputs,
    notification_history,
    dispatch_claims,
);
