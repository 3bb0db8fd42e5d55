//! Prompt construction for each pipeline stage.

use crate::connectors::Dataset;
use crate::request::{DataRequirements, IntentAnalysis, StepOutput};
use crate::types::{Language, TechnicalLevel};

pub fn intent_prompt(query: &str, dataset: &Dataset) -> String {
    format!(
        r#"Analyze this data question and describe the user's intent.

Question: {query}
Dataset: {name} - {description}

Return a JSON object with exactly these fields:
- "query_type": one of "exploratory", "statistical", "predictive", "diagnostic", "comparative"
- "main_objective": one sentence
- "required_analysis_types": array of strings
- "identified_entities": array of column or entity names mentioned
- "complexity_score": integer from 1 (trivial) to 10 (very hard)
- "estimated_steps": integer
- "needs_clarification": boolean, true only if the question cannot be answered as written
- "clarification_needed": the question to ask the user, or null
- "suggested_approach": one sentence, or null"#,
        name = dataset.name,
        description = dataset.description,
    )
}

pub fn requirements_prompt(
    query: &str,
    intent: &IntentAnalysis,
    schema: &str,
    sample_rows: &[serde_json::Value],
) -> String {
    let mut prompt = format!(
        r#"Determine which data is needed to answer this question.

Question: {query}
Objective: {objective}

Available schema:
{schema}"#,
        objective = intent.main_objective,
    );

    if !sample_rows.is_empty() {
        prompt.push_str("\n\nSample rows:\n");
        for row in sample_rows {
            prompt.push_str(&format!("{row}\n"));
        }
    }

    prompt.push_str(
        r#"
Return a JSON object with these fields:
- "tables_needed": array of table names
- "columns_needed": array of "table.column" strings
- "filters": array of filter descriptions
- "aggregations": array of aggregation descriptions"#,
    );
    prompt
}

pub fn plan_prompt(
    query: &str,
    intent: &IntentAnalysis,
    requirements: &DataRequirements,
    max_steps: usize,
) -> String {
    format!(
        r#"Create a step-by-step analysis plan for this question.

Question: {query}
Objective: {objective}
Complexity: {complexity}/10
Tables: {tables}
Columns: {columns}

Return a JSON object: {{"steps": [...]}}. Each step has:
- "step_type": one of "data_exploration", "data_cleaning", "statistical_analysis",
  "visualization", "machine_learning", "feature_engineering", "model_evaluation",
  "custom_computation"
- "language": one of "python", "r", "sql"
- "description": what the step does, one sentence

Use at most {max_steps} steps. Order them so each step can use the output of
the previous ones."#,
        objective = intent.main_objective,
        complexity = intent.clamped_complexity(),
        tables = requirements.tables_needed.join(", "),
        columns = requirements.columns_needed.join(", "),
    )
}

pub fn code_prompt(
    description: &str,
    language: Language,
    query: &str,
    schema: &str,
    prior_outputs: &[StepOutput],
) -> String {
    let mut prompt = format!(
        r#"Write {language} code for this analysis step.

Overall question: {query}
This step: {description}

Available schema:
{schema}

Datasets are mounted read-only under /data/. Write any files to /output/.
Print results as JSON to stdout: an object with a "rows" key for tabular
results, or a "summary" key otherwise. Return only the code in a fenced
code block."#
    );

    if !prior_outputs.is_empty() {
        prompt.push_str("\n\nOutput of previous steps:\n");
        for output in prior_outputs {
            prompt.push_str(&format!(
                "- step {} ({}): {}\n",
                output.sequence,
                output.step_type,
                truncate(&output.stdout, 500)
            ));
        }
    }

    prompt
}

pub fn interpretation_prompt(
    query: &str,
    outputs: &[StepOutput],
    level: TechnicalLevel,
) -> String {
    let mut results = String::new();
    for output in outputs {
        results.push_str(&format!(
            "Step {} ({}): {}\nOutput: {}\n\n",
            output.sequence,
            output.step_type,
            output.description,
            truncate(&output.stdout, 1000)
        ));
    }

    let audience = match level {
        TechnicalLevel::Beginner => {
            "Explain in plain language with no jargon. Define any statistical terms you must use."
        }
        TechnicalLevel::Intermediate => {
            "Use accessible language; brief technical terms are fine when standard."
        }
        TechnicalLevel::Advanced => "Be precise and technical; include relevant statistics.",
        TechnicalLevel::Expert => {
            "Be terse and technical. Include effect sizes, confidence, and caveats."
        }
    };

    format!(
        r#"Interpret these analysis results for the user.

Question: {query}

Results:
{results}
{audience}

Answer the question directly, note anything surprising, and state the main
limitations of the analysis."#
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn prompts_embed_their_inputs() {
        let dataset = Dataset {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "orders".to_string(),
            description: "sales orders".to_string(),
            location: "/srv/orders".to_string(),
            row_count: None,
        };
        let prompt = intent_prompt("Why did revenue drop in March?", &dataset);
        assert!(prompt.contains("Why did revenue drop in March?"));
        assert!(prompt.contains("orders - sales orders"));
        assert!(prompt.contains("needs_clarification"));
    }

    #[test]
    fn requirements_prompt_embeds_sample_rows_when_present() {
        let intent = IntentAnalysis {
            query_type: "exploratory".to_string(),
            main_objective: "find it".to_string(),
            required_analysis_types: vec![],
            identified_entities: vec![],
            complexity_score: 3,
            estimated_steps: 1,
            needs_clarification: false,
            clarification_needed: None,
            suggested_approach: None,
        };

        let rows = vec![serde_json::json!({"total": 12.5})];
        let prompt = requirements_prompt("q", &intent, "table orders:", &rows);
        assert!(prompt.contains("Sample rows:"));
        assert!(prompt.contains("12.5"));

        let bare = requirements_prompt("q", &intent, "table orders:", &[]);
        assert!(!bare.contains("Sample rows:"));
    }

    #[test]
    fn code_prompt_includes_prior_outputs() {
        let outputs = vec![StepOutput {
            sequence: 0,
            step_type: crate::types::StepType::DataExploration,
            description: "profile".to_string(),
            stdout: "x".repeat(600),
            artifacts: vec![],
        }];
        let prompt = code_prompt("fit a model", Language::Python, "q", "schema", &outputs);
        assert!(prompt.contains("Output of previous steps"));
        // Long outputs are cut to keep the prompt bounded.
        assert!(prompt.contains("..."));
    }
}
