use super::{Callable, FunctionOutput, ParamKind, ParamSchema, Params, ResultValue, ToolDescriptor};
use crate::error::AppError;

pub struct Multiply;

impl Callable for Multiply {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "multiply".into(),
            description: "Multiply multiple numbers together".into(),
            params: vec![ParamSchema::required(
                "numbers",
                ParamKind::NumberArray,
                "Array of numbers to multiply together",
            )],
        }
    }

    fn call(&self, params: &Params) -> Result<FunctionOutput, AppError> {
        let numbers = params.numbers("numbers")?;
        if numbers.len() < 2 {
            return Err(AppError::warning("at least two numbers are required"));
        }
        Ok(FunctionOutput {
            result: ResultValue::Number(numbers.iter().product()),
            operation: "multiply".into(),
            inputs: numbers.to_vec(),
        })
    }
}
