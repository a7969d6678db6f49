//! HL7 v3 Structured Product Labeling extractor

use std::path::Path;
use tracing::debug;

use super::xml::{self, Element};
use super::{
    ExtractError, ExtractedDocument, ExtractedIngredient, ExtractedMarketingStatus,
    ExtractedPackage, RecordExtractor,
};

pub const HL7_NAMESPACE: &str = "urn:hl7-org:v3";

/// Code system OID of National Drug Codes
pub const NDC_CODE_SYSTEM: &str = "2.16.840.1.113883.6.69";

/// LOINC section codes that carry package descriptions
pub const PACKAGING_SECTION_CODES: [&str; 2] = ["34069-5", "51945-4"];

const ACTIVE_INGREDIENT_CLASS: &str = "ACT";

/// Reads SPL XML files from disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct SplXmlExtractor;

impl SplXmlExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract from an in-memory document; `path` is only used for naming.
    pub fn extract_str(&self, content: &str, path: &Path) -> Result<ExtractedDocument, ExtractError> {
        let root = xml::parse_document(content).map_err(|source| ExtractError::Xml {
            path: path.to_path_buf(),
            source,
        })?;

        let in_hl7_namespace = root
            .namespace
            .as_deref()
            .map_or(true, |ns| ns == HL7_NAMESPACE);
        if root.name != "document" || !in_hl7_namespace {
            return Err(ExtractError::MissingRoot {
                path: path.to_path_buf(),
                found: root.name.clone(),
            });
        }

        let mut doc = ExtractedDocument {
            document_id: attr_of(root.find("id"), "root"),
            set_id: attr_of(root.find("setId"), "root"),
            version_number: version_number(&root, path)?,
            effective_time: attr_of(root.find("effectiveTime"), "value"),
            raw_data: Some(root.to_json().to_string()),
            source_filename: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ..ExtractedDocument::default()
        };

        if let Some(outer) = root.find("manufacturedProduct") {
            if let Some(product) = outer.child("manufacturedProduct") {
                extract_product(product, &mut doc);
            }
            doc.manufacturer_name = text_of(outer.path("manufacturer/name"));
        }

        let body = root
            .find_all("component")
            .into_iter()
            .find_map(|component| component.child("structuredBody"));
        if let Some(body) = body {
            doc.packaging = extract_packaging(body);
            doc.marketing_status = extract_marketing(body);
        }

        debug!(
            "Extracted {:?} from {}: {} ingredient(s), {} package(s), {} NDC(s)",
            doc.document_id,
            doc.source_filename,
            doc.ingredients.len(),
            doc.packaging.len(),
            doc.product_ndcs.len()
        );

        Ok(doc)
    }
}

impl RecordExtractor for SplXmlExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, ExtractError> {
        let content = std::fs::read_to_string(path).map_err(|source| ExtractError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.extract_str(&content, path)
    }
}

fn attr_of(element: Option<&Element>, name: &str) -> Option<String> {
    element.and_then(|e| e.attr(name)).map(str::to_string)
}

fn text_of(element: Option<&Element>) -> Option<String> {
    element.and_then(Element::text).map(str::to_string)
}

/// A missing `versionNumber` means version 0; a present but non-numeric
/// one fails the document.
fn version_number(root: &Element, path: &Path) -> Result<i64, ExtractError> {
    match root.find("versionNumber").and_then(|e| e.attr("value")) {
        None => Ok(0),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ExtractError::InvalidValue {
                path: path.to_path_buf(),
                field: "versionNumber",
                value: value.to_string(),
            }),
    }
}

fn extract_product(product: &Element, doc: &mut ExtractedDocument) {
    doc.product_name = text_of(product.find("name"));
    doc.dosage_form = attr_of(product.find("formCode"), "displayName");
    doc.route_of_administration = attr_of(product.find("routeCode"), "displayName");

    if let Some(entity) = product.child("asEquivalentEntity") {
        doc.product_ndcs = entity
            .children_named("code")
            .filter(|code| code.attr("codeSystem") == Some(NDC_CODE_SYSTEM))
            .filter_map(|code| code.attr("code"))
            .filter(|code| !code.is_empty())
            .map(str::to_string)
            .collect();
    }

    doc.ingredients = product
        .find_all("ingredient")
        .into_iter()
        .map(extract_ingredient)
        .collect();
}

fn extract_ingredient(ingredient: &Element) -> ExtractedIngredient {
    let substance = ingredient.find("ingredientSubstance");
    let quantity = ingredient.find("quantity");
    let numerator = quantity.and_then(|q| q.find("numerator"));
    let denominator = quantity.and_then(|q| q.find("denominator"));

    ExtractedIngredient {
        ingredient_name: text_of(substance.and_then(|s| s.find("name"))),
        substance_code: attr_of(substance.and_then(|s| s.find("code")), "code"),
        strength_numerator: attr_of(numerator, "value"),
        strength_denominator: attr_of(denominator, "value"),
        unit_of_measure: attr_of(numerator, "unit"),
        is_active_ingredient: ingredient.attr("classCode") == Some(ACTIVE_INGREDIENT_CLASS),
    }
}

fn extract_packaging(body: &Element) -> Vec<ExtractedPackage> {
    let mut packages = Vec::new();

    for section in body.find_all("section") {
        let is_packaging = section
            .find("code")
            .and_then(|c| c.attr("code"))
            .is_some_and(|code| PACKAGING_SECTION_CODES.contains(&code));
        if !is_packaging {
            continue;
        }

        for part in section.find_all("part") {
            let Some(code) = part.child("code") else {
                continue;
            };
            let description = part.child("name").or_else(|| part.child("desc"));
            packages.push(ExtractedPackage {
                package_ndc: code.attr("code").map(str::to_string),
                package_description: text_of(description),
                package_type: attr_of(part.child("formCode"), "displayName"),
            });
        }
    }

    packages
}

fn extract_marketing(body: &Element) -> Vec<ExtractedMarketingStatus> {
    // Nested subjects would otherwise yield the same act twice.
    let mut acts: Vec<&Element> = Vec::new();
    for subject in body.find_all("subject") {
        for act in subject.find_all("marketingAct") {
            if !acts.iter().any(|seen| std::ptr::eq(*seen, act)) {
                acts.push(act);
            }
        }
    }

    acts.into_iter()
        .map(|act| {
            let window = act.child("effectiveTime");
            ExtractedMarketingStatus {
                marketing_category: attr_of(act.child("statusCode"), "code"),
                start_date: attr_of(window.and_then(|w| w.child("low")), "value"),
                end_date: attr_of(window.and_then(|w| w.child("high")), "value"),
            }
        })
        .collect()
}
