//! Report rendering for fitted meta-models.

use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};

use super::meta_model::FittedMetaModel;
use super::types::ModelComparisonRow;

/// Text summary of a converged fit.
///
/// Derived from the point estimate and covariance only, so the summary is
/// identical between the full and light serialized forms.
pub(crate) fn render_summary(fitted: &FittedMetaModel, stratum_group: &str) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Parameter").add_attribute(Attribute::Bold),
        Cell::new("Estimate").add_attribute(Attribute::Bold),
        Cell::new("Std. error").add_attribute(Attribute::Bold),
    ]);
    for (index, name) in fitted.parameter_names.iter().enumerate() {
        let estimate = fitted.final_parameter_estimates[index];
        let std_error = fitted.parameter_covariance[index][index].max(0.0).sqrt();
        table.add_row(vec![
            name.clone(),
            format!("{estimate:.6}"),
            format!("{std_error:.6}"),
        ]);
    }
    format!(
        "Meta-model {stratum_group}\n\
         Model form: {}\n\
         Model definition: {}\n\
         Output type: {}\n\
         LPML: {:.6}\n\
         Acceptance rate: {:.4}\n\
         {table}",
        fitted.form,
        fitted.form.definition(),
        fitted.output_type,
        fitted.log_pseudomarginal_likelihood,
        fitted.acceptance_rate,
    )
}

/// Render the model-comparison table of a fit.
///
/// Non-converged rows keep their place with an `NaN` LPML and are flagged
/// in red.
#[must_use]
pub fn render_comparison_table(rows: &[ModelComparisonRow]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ModelImplementation", "LPML", "Weight", "Converged"]);
    for row in rows {
        let converged_cell = if row.converged {
            Cell::new("true")
        } else {
            Cell::new("false").fg(Color::Red)
        };
        table.add_row(vec![
            Cell::new(row.model_form.to_string()),
            Cell::new(format!("{:.6}", row.lpml_value())),
            Cell::new(format!("{:.6}", row.weight)),
            converged_cell,
        ]);
    }
    table.to_string()
}
