use crate::backend::{ChatMessage, ContentPart};

/// Instruction sent with every uploaded image.
pub const CLASSIFICATION_PROMPT: &str = concat!(
    "You are a garbage classification assistant. Based on the image, identify and classify all distinct parts of the object. ",
    "For each part, determine the type of garbage from the following options: A: Cardboard, B: Glass, C: Metal, D: Paper, E: Plastic, F: Trash. ",
    "Your response must be in a JSON format. The JSON should contain a single key, 'material', which holds an array of objects. ",
    "Each object in the array must have two keys: 'part_name' (a brief description of the item) and 'answer' (the classification from the provided options, in the format 'A: Cardboard'). ",
    "If the image contains multiple distinct parts made of different materials, list each part as a separate object in the 'material' array. ",
    "For example, if the image shows a paper coffee cup with a plastic lid, you should output two separate objects in the array. ",
    "The cup should be classified as 'D: Paper' and the lid as 'E: Plastic'. ",
    "If a part is not classified into a specific category, consider it as 'F: Trash'. ",
    "**Do not repeat an object part if it is identical to a previously listed part. For example, if there are multiple apples, only list 'Apples' once.**",
);

/// A single user turn: the image, then the instruction.
pub fn classification_messages() -> Vec<ChatMessage> {
    vec![ChatMessage::user(vec![
        ContentPart::Image,
        ContentPart::Text {
            text: CLASSIFICATION_PROMPT.to_string(),
        },
    ])]
}
