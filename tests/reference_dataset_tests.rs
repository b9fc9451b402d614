// The shipped reference dataset loads and resolves the spellings operators type

use std::path::PathBuf;

use imei_relay::normalize::{normalize, Rejection};
use imei_relay::reference::{Field, ReferenceError, ReferenceTable};
use imei_relay::types::PendingRequest;
use tempfile::TempDir;

fn shipped_table() -> ReferenceTable {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("data/reference.csv");
    ReferenceTable::from_path(path).expect("shipped dataset should load")
}

#[test]
fn test_shipped_dataset_loads() {
    let table = shipped_table();
    assert!(table.len() >= 10);
    assert!(table.canonical(Field::Brand).contains("Apple"));
    assert!(table.canonical(Field::Country).contains("Estados Unidos"));
}

#[test]
fn test_reference_example_request() {
    let table = shipped_table();
    let request = PendingRequest::new("1", "Apple", "iPhone 11", "PE", "490154203237518");

    let record = normalize(&request, &table).unwrap();

    assert_eq!(record.canonical_brand, "Apple");
    assert_eq!(record.canonical_model, "iPhone 11");
    assert_eq!(record.canonical_country, "Peru");
    assert_eq!(record.device_imei, "490154203237518");
}

#[test]
fn test_operator_spellings() {
    let table = shipped_table();
    let cases = [
        ("apple inc", "a2633", "ee.uu.", ("Apple", "iPhone 13", "Estados Unidos")),
        ("SAMSUNG", "Samsung Galaxy S23", " chl ", ("Samsung", "Galaxy S23", "Chile")),
        ("moto", "XT2343-1", "Argentina", ("Motorola", "Moto G54", "Argentina")),
        ("Huawei", "MNA-LX9", "República Popular China", ("Huawei", "P60 Pro", "China")),
        ("mi", "redmi note 12", "Chile", ("Xiaomi", "Redmi Note 12", "Chile")),
    ];

    for (brand, model, country, (want_brand, want_model, want_country)) in cases {
        let triple = table
            .resolve(brand, model, country)
            .unwrap_or_else(|e| panic!("{brand}/{model}/{country}: {e}"));
        assert_eq!(triple.brand, want_brand);
        assert_eq!(triple.model, want_model);
        assert_eq!(triple.country, want_country);
    }
}

#[test]
fn test_known_fields_in_wrong_country() {
    let table = shipped_table();
    let request = PendingRequest::new("2", "Apple", "iPhone 15 Pro", "Chile", "490154203237518");

    let rejection = normalize(&request, &table).unwrap_err();

    assert_eq!(rejection.code(), "not-found");
    assert!(matches!(rejection, Rejection::NotFound { .. }));
}

#[test]
fn test_missing_dataset_names_the_path() {
    let err = ReferenceTable::from_path("/nonexistent/reference.csv").unwrap_err();
    assert!(matches!(err, ReferenceError::Io { .. }));
    assert!(err.to_string().contains("/nonexistent/reference.csv"));
}

#[test]
fn test_row_without_model_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.csv");
    std::fs::write(
        &path,
        "brand,model,country,brand_aliases,model_aliases,country_aliases\nApple,,Peru,,,\n",
    )
    .unwrap();

    let err = ReferenceTable::from_path(&path).unwrap_err();
    assert!(matches!(
        err,
        ReferenceError::MissingValue { line: 2, field: Field::Model }
    ));
}

#[test]
fn test_blank_brand_is_taken_from_the_model() {
    let table = shipped_table();
    let request = PendingRequest::new("3", "", "Galaxy S23", "CL", "490154203237518");

    let record = normalize(&request, &table).unwrap();

    assert_eq!(record.canonical_brand, "Samsung");
    assert_eq!(record.canonical_model, "Galaxy S23");
    assert_eq!(record.canonical_country, "Chile");
}
