use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::caching::{CacheContents, CacheError, CacheKey, CacheKeyBuilder};

/// Model and variant markers that indicate a diesel engine.
static DIESEL_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"tdi|cdi|hdi|dci|crdi|d4d|jtd|tdci").unwrap());

/// Variant markers that indicate a petrol engine.
static PETROL_MARKERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"petrol|gasoline|tsi|mpi|gdi|vti|tfsi").unwrap());

/// Maps the many spellings of a fuel type onto a canonical value.
///
/// Unknown values are passed through lower-cased and trimmed; an empty
/// string means "not provided".
pub fn normalize_fuel_type(fuel_type: &str) -> Option<String> {
    let normalized = fuel_type.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    let canonical = match normalized.as_str() {
        "gasoline" | "unleaded" | "gas" | "petrol" => "petrol",
        "diesel" | "gasoil" | "derv" => "diesel",
        "hybrid" | "phev" | "hev" => "hybrid",
        "electric" | "ev" | "bev" => "electric",
        _ => return Some(normalized),
    };
    Some(canonical.to_owned())
}

/// The identifying attributes of a vehicle lookup.
///
/// The field order in [`cache_key`](Self::cache_key) is the contract that
/// keeps previously cached entries reachable; optional fields that are
/// absent are omitted from the key rather than emitting placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleIdent {
    pub make: String,
    pub model: String,
    pub year: Option<u16>,
    /// Canonicalized via [`normalize_fuel_type`] on construction.
    pub fuel_type: Option<String>,
    /// Trim level or engine designation, only used for fuel inference.
    pub variant: Option<String>,
    /// Engine capacity in cc, only used for fuel inference.
    pub engine_capacity: Option<u32>,
}

impl VehicleIdent {
    /// Creates an ident from the two required fields.
    ///
    /// Make and model must be non-empty; everything upstream of the cache
    /// relies on this validation happening before normalization.
    pub fn new(make: &str, model: &str) -> CacheContents<Self> {
        if make.trim().is_empty() || model.trim().is_empty() {
            return Err(CacheError::BadRequest(
                "vehicle make and model are required".into(),
            ));
        }
        Ok(VehicleIdent {
            make: make.to_owned(),
            model: model.to_owned(),
            year: None,
            fuel_type: None,
            variant: None,
            engine_capacity: None,
        })
    }

    /// Builds an ident from a complete vehicle record, as returned by a
    /// registration lookup.
    ///
    /// Reads the record fields used for keying: `make`, `model` (falling
    /// back to `vehicleModel`), `year`, `fuelType`, `variant` and
    /// `engineCapacity`. Year and capacity may arrive as numbers or
    /// strings, depending on the upstream.
    pub fn from_record(record: &Value) -> CacheContents<Self> {
        let make = record.get("make").and_then(Value::as_str).unwrap_or_default();
        let model = record
            .get("model")
            .or_else(|| record.get("vehicleModel"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut ident = Self::new(make, model)?;
        ident.year = record.get("year").and_then(numeric_field::<u16>);
        ident.fuel_type = record
            .get("fuelType")
            .and_then(Value::as_str)
            .and_then(normalize_fuel_type);
        ident.variant = record
            .get("variant")
            .and_then(Value::as_str)
            .map(str::to_owned);
        ident.engine_capacity = record.get("engineCapacity").and_then(numeric_field::<u32>);
        Ok(ident)
    }

    pub fn with_year(mut self, year: u16) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_fuel_type(mut self, fuel_type: &str) -> Self {
        self.fuel_type = normalize_fuel_type(fuel_type);
        self
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_owned());
        self
    }

    pub fn with_engine_capacity(mut self, cc: u32) -> Self {
        self.engine_capacity = Some(cc);
        self
    }

    /// Derives the cache key for this vehicle under the given subject.
    ///
    /// Field order: subject, make, model, year, fuel type.
    pub fn cache_key(&self, subject: &str) -> CacheKey {
        let year = self.year.map(|y| y.to_string());

        let mut builder = CacheKeyBuilder::new();
        builder
            .field(subject)
            .field(&self.make)
            .field(&self.model)
            .opt_field(year.as_deref())
            .opt_field(self.fuel_type.as_deref());
        builder.build()
    }

    /// Best-effort fuel type, inferred from other attributes when none was
    /// provided explicitly.
    ///
    /// Useful for older vehicles where the registration data carries no
    /// fuel type: common diesel engine codes in the model or variant name,
    /// petrol markers in the variant, and very small displacements (diesel
    /// engines rarely come below a litre) all give it away.
    pub fn determine_fuel_type(&self) -> Option<String> {
        if let Some(fuel_type) = &self.fuel_type {
            return Some(fuel_type.clone());
        }

        if DIESEL_MARKERS.is_match(&self.model.to_lowercase()) {
            return Some("diesel".to_owned());
        }

        if let Some(variant) = &self.variant {
            let variant = variant.to_lowercase();
            if variant.contains("diesel") || DIESEL_MARKERS.is_match(&variant) {
                return Some("diesel".to_owned());
            }
            if PETROL_MARKERS.is_match(&variant) {
                return Some("petrol".to_owned());
            }
        }

        match self.engine_capacity {
            Some(cc) if cc > 0 && cc < 1000 => Some("petrol".to_owned()),
            _ => None,
        }
    }
}

/// Reads a numeric record field that may arrive as a number or a string.
fn numeric_field<T: TryFrom<u64> + std::str::FromStr>(value: &Value) -> Option<T> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| T::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Derives the cache key for lookups keyed by a single identifier, such as
/// a registration, a defect id or a manual section id.
///
/// The identifier is used verbatim apart from the usual normalization, so
/// callers should canonicalize registration plates (case, spacing) before
/// looking them up.
pub fn id_key(subject: &str, id: &str) -> CacheKey {
    let mut builder = CacheKeyBuilder::new();
    builder.field(subject).field(id);
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fuel_type() {
        assert_eq!(normalize_fuel_type("Unleaded").as_deref(), Some("petrol"));
        assert_eq!(normalize_fuel_type("DERV").as_deref(), Some("diesel"));
        assert_eq!(normalize_fuel_type("PHEV").as_deref(), Some("hybrid"));
        assert_eq!(normalize_fuel_type("ev").as_deref(), Some("electric"));
        assert_eq!(normalize_fuel_type(" LPG ").as_deref(), Some("lpg"));
        assert_eq!(normalize_fuel_type("  "), None);
    }

    #[test]
    fn test_required_fields() {
        assert!(VehicleIdent::new("Ford", "Focus").is_ok());
        assert!(matches!(
            VehicleIdent::new("", "Focus"),
            Err(CacheError::BadRequest(_))
        ));
        assert!(matches!(
            VehicleIdent::new("Ford", "  "),
            Err(CacheError::BadRequest(_))
        ));
    }

    #[test]
    fn test_cache_key_fields() {
        let ident = VehicleIdent::new("Ford", "Focus")
            .unwrap()
            .with_year(2015)
            .with_fuel_type("Gasoline");

        assert_eq!(
            ident.cache_key("tech_specs").as_str(),
            "tech_specs_ford_focus_2015_petrol"
        );

        let without_year = VehicleIdent::new("Ford", "Focus").unwrap();
        assert_eq!(
            without_year.cache_key("tech_specs").as_str(),
            "tech_specs_ford_focus"
        );
    }

    #[test]
    fn test_fuel_inference_from_model() {
        let ident = VehicleIdent::new("Volkswagen", "Golf TDI").unwrap();
        assert_eq!(ident.determine_fuel_type().as_deref(), Some("diesel"));
    }

    #[test]
    fn test_fuel_inference_from_variant() {
        let ident = VehicleIdent::new("Skoda", "Octavia")
            .unwrap()
            .with_variant("2.0 TFSI vRS");
        assert_eq!(ident.determine_fuel_type().as_deref(), Some("petrol"));
    }

    #[test]
    fn test_fuel_inference_from_capacity() {
        let ident = VehicleIdent::new("Toyota", "Aygo")
            .unwrap()
            .with_engine_capacity(998);
        assert_eq!(ident.determine_fuel_type().as_deref(), Some("petrol"));

        let unknown = VehicleIdent::new("Toyota", "Corolla")
            .unwrap()
            .with_engine_capacity(1600);
        assert_eq!(unknown.determine_fuel_type(), None);
    }

    #[test]
    fn test_explicit_fuel_wins() {
        let ident = VehicleIdent::new("Volkswagen", "Golf TDI")
            .unwrap()
            .with_fuel_type("petrol");
        assert_eq!(ident.determine_fuel_type().as_deref(), Some("petrol"));
    }

    #[test]
    fn test_from_record() {
        let record = serde_json::json!({
            "make": "Ford",
            "vehicleModel": "Focus",
            "year": "2015",
            "fuelType": "Unleaded",
            "engineCapacity": 1596,
        });
        let ident = VehicleIdent::from_record(&record).unwrap();
        assert_eq!(ident.make, "Ford");
        assert_eq!(ident.model, "Focus");
        assert_eq!(ident.year, Some(2015));
        assert_eq!(ident.fuel_type.as_deref(), Some("petrol"));
        assert_eq!(ident.engine_capacity, Some(1596));

        let incomplete = serde_json::json!({ "make": "Ford" });
        assert!(matches!(
            VehicleIdent::from_record(&incomplete),
            Err(CacheError::BadRequest(_))
        ));
    }

    #[test]
    fn test_id_key() {
        assert_eq!(id_key("analysis", "AB12 CDE").as_str(), "analysis_ab12_cde");
        assert_eq!(id_key("defect", "1.2.3").as_str(), "defect_1.2.3");
    }
}
