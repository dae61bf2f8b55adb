use super::BindValue;

pub(super) fn push_text(bind_params: &mut Vec<BindValue>, value: String) -> usize {
    bind_params.push(BindValue::Text(value));
    bind_params.len()
}

pub(super) fn push_integer(bind_params: &mut Vec<BindValue>, value: i64) -> usize {
    bind_params.push(BindValue::Integer(value));
    bind_params.len()
}
