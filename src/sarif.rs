use serde_json::json;
use serde_sarif::sarif::{
    Invocation, Location, LogicalLocation, Message, Result as SarifResult, Run, Sarif, Tool,
    ToolComponent, SCHEMA_URL,
};

use crate::report::{Annotation, DefectReport, PRIORITY_HIGH, PRIORITY_NORMAL};

pub(crate) fn result_message(text: impl Into<String>) -> Message {
    Message::builder().text(text.into()).build()
}

pub(crate) fn method_location(class_name: &str, method_name: &str, descriptor: &str) -> Location {
    let logical = LogicalLocation::builder()
        .name(format!("{class_name}.{method_name}{descriptor}"))
        .kind("function")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

pub(crate) fn class_location(class_name: &str) -> Location {
    let logical = LogicalLocation::builder()
        .name(class_name)
        .kind("type")
        .build();
    Location::builder().logical_locations(vec![logical]).build()
}

fn defect_location(defect: &DefectReport) -> Option<Location> {
    if let Some(method) = defect.method() {
        return Some(method_location(
            &method.class_name,
            &method.name,
            &method.descriptor,
        ));
    }
    defect.class_name().map(class_location)
}

fn defect_message(defect: &DefectReport) -> Message {
    let severity = match defect.priority {
        PRIORITY_HIGH => "high",
        PRIORITY_NORMAL => "normal",
        _ => "low",
    };
    let detail: Vec<String> = defect
        .annotations
        .iter()
        .filter(|annotation| !matches!(annotation, Annotation::Method { .. }))
        .map(ToString::to_string)
        .collect();
    if detail.is_empty() {
        result_message(format!("{} ({severity} priority)", defect.pattern))
    } else {
        result_message(format!(
            "{} ({severity} priority): {}",
            defect.pattern,
            detail.join(", ")
        ))
    }
}

fn defect_result(defect: &DefectReport) -> SarifResult {
    let builder = SarifResult::builder()
        .rule_id(defect.pattern.clone())
        .message(defect_message(defect));
    match defect_location(defect) {
        Some(location) => builder.locations(vec![location]).build(),
        None => builder.build(),
    }
}

pub fn build_invocation() -> Invocation {
    let arguments: Vec<String> = std::env::args().collect();
    let command_line = arguments.join(" ");

    Invocation::builder()
        .execution_successful(true)
        .arguments(arguments)
        .command_line(command_line)
        .build()
}

pub fn build_sarif(defects: &[DefectReport], invocation: Invocation) -> Sarif {
    let driver = ToolComponent::builder()
        .name("faultline")
        .information_uri("https://github.com/faultline-dev/faultline")
        .build();
    let tool = Tool {
        driver,
        extensions: None,
        properties: None,
    };
    let run = Run::builder()
        .tool(tool)
        .invocations(vec![invocation])
        .results(defects.iter().map(defect_result).collect::<Vec<_>>())
        .build();

    Sarif::builder()
        .schema(SCHEMA_URL)
        .runs(vec![run])
        .version(json!("2.1.0"))
        .build()
}
