//! Canonical record shape per entity type
//!
//! Drives mapping generation (synonyms), transform validation (known field
//! names) and structural validation (required fields).

use super::{EntityType, ValueKind};

/// Field the canonical store expects
#[derive(Debug, Clone, Copy)]
pub struct CanonicalField {
    pub name: &'static str,
    pub kind: ValueKind,
    pub required: bool,
    /// Vendor field names recognised when drafting a mapping
    pub synonyms: &'static [&'static str],
}

const fn field(
    name: &'static str,
    kind: ValueKind,
    required: bool,
    synonyms: &'static [&'static str],
) -> CanonicalField {
    CanonicalField {
        name,
        kind,
        required,
        synonyms,
    }
}

/// Canonical field holding the vendor id of the owning patient
pub const PATIENT_REF_FIELD: &str = "patientSourceId";

const PATIENT_REF_SYNONYMS: &[&str] = &[
    "patient_id",
    "patientid",
    "client_id",
    "customer_id",
    "patient",
    "patient.reference",
    "subject.reference",
];

const PATIENT: &[CanonicalField] = &[
    field(
        "firstName",
        ValueKind::String,
        true,
        &["first_name", "firstname", "given_name", "given", "fname", "name.0.given.0"],
    ),
    field(
        "lastName",
        ValueKind::String,
        true,
        &["last_name", "lastname", "surname", "family_name", "family", "lname", "name.0.family"],
    ),
    field(
        "dateOfBirth",
        ValueKind::Date,
        false,
        &["dob", "date_of_birth", "birth_date", "birthdate"],
    ),
    field("email", ValueKind::String, false, &["email", "email_address", "e_mail"]),
    field(
        "phone",
        ValueKind::String,
        false,
        &["phone", "phone_number", "mobile", "cell", "telephone"],
    ),
    field("gender", ValueKind::String, false, &["gender", "sex"]),
];

const APPOINTMENT: &[CanonicalField] = &[
    field(PATIENT_REF_FIELD, ValueKind::String, true, PATIENT_REF_SYNONYMS),
    field(
        "startTime",
        ValueKind::DateTime,
        true,
        &["start", "start_time", "starts_at", "appointment_time", "scheduled_at"],
    ),
    field("endTime", ValueKind::DateTime, false, &["end", "end_time", "ends_at"]),
    field("status", ValueKind::String, false, &["status", "appointment_status", "state"]),
    field(
        "practitioner",
        ValueKind::String,
        false,
        &["provider", "practitioner", "staff", "staff_name"],
    ),
    field(
        "service",
        ValueKind::String,
        false,
        &["service", "treatment", "service_name", "appointment_type"],
    ),
];

const CHART: &[CanonicalField] = &[
    field(PATIENT_REF_FIELD, ValueKind::String, true, PATIENT_REF_SYNONYMS),
    field(
        "recordedAt",
        ValueKind::DateTime,
        true,
        &["recorded_at", "chart_date", "visit_date", "created_at", "date"],
    ),
    field(
        "note",
        ValueKind::String,
        false,
        &["note", "notes", "body", "content", "text", "treatment_notes"],
    ),
    field("author", ValueKind::String, false, &["author", "provider", "practitioner"]),
];

const INVOICE: &[CanonicalField] = &[
    field(PATIENT_REF_FIELD, ValueKind::String, true, PATIENT_REF_SYNONYMS),
    field(
        "totalCents",
        ValueKind::Cents,
        true,
        &["total", "amount", "total_amount", "grand_total", "invoice_total"],
    ),
    field(
        "issuedAt",
        ValueKind::DateTime,
        false,
        &["issued_at", "invoice_date", "created_at", "date"],
    ),
    field("status", ValueKind::String, false, &["status", "payment_status"]),
    field("appointmentSourceId", ValueKind::String, false, &["appointment_id", "appointment"]),
];

const PHOTO: &[CanonicalField] = &[
    field(PATIENT_REF_FIELD, ValueKind::String, true, PATIENT_REF_SYNONYMS),
    field(
        "fileRef",
        ValueKind::String,
        true,
        &["url", "file", "file_url", "image_url", "photo_url", "path", "content.url"],
    ),
    field("takenAt", ValueKind::DateTime, false, &["taken_at", "created_at", "date"]),
    field("caption", ValueKind::String, false, &["caption", "description", "title"]),
];

const CONSENT: &[CanonicalField] = &[
    field(PATIENT_REF_FIELD, ValueKind::String, true, PATIENT_REF_SYNONYMS),
    field(
        "formName",
        ValueKind::String,
        true,
        &["form", "form_name", "consent_type", "title", "name"],
    ),
    field("signedAt", ValueKind::DateTime, false, &["signed_at", "signed_date", "date_time", "date"]),
];

const DOCUMENT: &[CanonicalField] = &[
    field(PATIENT_REF_FIELD, ValueKind::String, true, PATIENT_REF_SYNONYMS),
    field(
        "fileRef",
        ValueKind::String,
        true,
        &["url", "file", "file_url", "document_url", "path", "content.0.attachment.url"],
    ),
    field("title", ValueKind::String, false, &["title", "name", "filename", "description"]),
    field("createdAt", ValueKind::DateTime, false, &["created_at", "uploaded_at", "date"]),
];

/// Canonical fields for an entity type, in display order
pub fn canonical_fields(entity_type: EntityType) -> &'static [CanonicalField] {
    match entity_type {
        EntityType::Patient => PATIENT,
        EntityType::Appointment => APPOINTMENT,
        EntityType::Chart => CHART,
        EntityType::Invoice => INVOICE,
        EntityType::Photo => PHOTO,
        EntityType::Consent => CONSENT,
        EntityType::Document => DOCUMENT,
    }
}

/// Patient fields that are not part of the matching table but may be derived
pub const PATIENT_FULL_NAME_FIELD: &str = "fullName";

/// Whether `name` is a field the canonical store accepts for `entity_type`
pub fn is_canonical_field(entity_type: EntityType, name: &str) -> bool {
    (entity_type == EntityType::Patient && name == PATIENT_FULL_NAME_FIELD)
        || canonical_fields(entity_type).iter().any(|f| f.name == name)
}

pub fn required_fields(entity_type: EntityType) -> impl Iterator<Item = &'static CanonicalField> {
    canonical_fields(entity_type).iter().filter(|f| f.required)
}
