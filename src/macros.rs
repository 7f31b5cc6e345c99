#[macro_export]
macro_rules! regex {
    ($pat:literal) => {{
        static RE: once_cell::sync::Lazy<regex::Regex> =
            once_cell::sync::Lazy::new(|| regex::Regex::new($pat).unwrap());
        &*RE
    }};
}

#[macro_export]
macro_rules! paths {
    ($($spec:expr),* $(,)?) => {
        $crate::PathSpec::Many(vec![ $($crate::PathSpec::from($spec)),* ])
    };
}

#[macro_export]
macro_rules! rule {
    (
        name: $name:expr
        $(, inputs: [ $($input:expr),* $(,)? ])?
        $(, outputs: [ $($output:expr),* $(,)? ])?
        $(, message: $message:expr)?
        $(, action: $action:expr)?
        $(,)?
    ) => {{
        (|| -> $crate::Result<$crate::Rule> {
            let mut rule = $crate::Rule::new($name);
            $( rule.add_input($crate::paths![ $($input),* ])?; )?
            $( rule.add_output($crate::paths![ $($output),* ])?; )?
            $( rule.set_message($message); )?
            $( rule.set_action($action); )?
            Ok(rule)
        })()
    }};
}
