use std::borrow::Cow;

use crate::model::{QaRecord, Vendor};

const JUDGE_PROMPT_TEMPLATE: &str = r#"
Given the following inputs:
Question: {question}
Answer 1 (Ground Truth): {reference_answer}
Answer 2 (Model Output): {candidate_answer}

Your task is to rate the quality of Answer 2, using Answer 1 as the ground truth for a perfect response. Use the following 4-point scale:


**4: Semantically Identical**
- Answer 2 conveys the exact same meaning as Answer 1.
- It is fully correct and complete. Wording differences are acceptable.

**3: Different but valid**
- Answer 2 is factually correct and answers the question, but omits some details, nuance, or key points found in Answer 1, or adds some additional, plausible insight.
- The core idea is right, but the substance is partial.

**2: Factually incorrect in an important way**
- Answer 2 attempts to answer the question, but is factually incorrect in a significant way.
- Or, it mixes correct information with fabricated/hallucinated details not supported by the question or Answer 1.

**1: Irrelevant or Wrong**
- Answer 2 completely fails to answer the question, is on a different topic, or is nonsensical.


Provide both the Likert rating followed by a brief explanation for your choice. Format the output as a valid parsable JSON like: {"rating": 1-4, "reason": "Your brief justification here."}"#;

pub fn build_judge_prompt(question: &str, reference_answer: &str, candidate_answer: &str) -> String {
    // Single pass so placeholder-looking text inside an answer is never re-substituted.
    let mut prompt = String::with_capacity(
        JUDGE_PROMPT_TEMPLATE.len()
            + question.len()
            + reference_answer.len()
            + candidate_answer.len(),
    );
    let mut rest = JUDGE_PROMPT_TEMPLATE;

    while let Some(start) = rest.find('{') {
        prompt.push_str(&rest[..start]);
        let tail = &rest[start..];
        let (value, consumed) = if let Some(after) = tail.strip_prefix("{question}") {
            (question, tail.len() - after.len())
        } else if let Some(after) = tail.strip_prefix("{reference_answer}") {
            (reference_answer, tail.len() - after.len())
        } else if let Some(after) = tail.strip_prefix("{candidate_answer}") {
            (candidate_answer, tail.len() - after.len())
        } else {
            ("{", 1)
        };
        prompt.push_str(value);
        rest = &tail[consumed..];
    }
    prompt.push_str(rest);

    prompt
}

pub fn vendor_judge_prompt(vendor: Vendor, record: &QaRecord) -> String {
    build_judge_prompt(
        &record.question,
        &escape_answer(vendor, &record.reference_answer),
        &escape_answer(vendor, &record.candidate_answer),
    )
}

// Claude prompts carry every backslash in both answers doubled.
fn escape_answer(vendor: Vendor, answer: &str) -> Cow<'_, str> {
    match vendor {
        Vendor::Claude => Cow::Owned(answer.replace('\\', "\\\\")),
        Vendor::Gemini | Vendor::Openai => Cow::Borrowed(answer),
    }
}
