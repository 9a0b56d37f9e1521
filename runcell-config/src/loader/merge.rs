use toml::Value;

/// Overlay `overlay` onto `base`. Tables merge key by key at every depth;
/// any other value in the overlay wins outright.
pub fn merge_toml_values(base: &mut Value, overlay: &Value) {
    let (Value::Table(base_table), Value::Table(overlay_table)) = (&mut *base, overlay) else {
        *base = overlay.clone();
        return;
    };

    for (key, overlay_value) in overlay_table {
        match base_table.get_mut(key) {
            Some(existing) => merge_toml_values(existing, overlay_value),
            None => {
                base_table.insert(key.clone(), overlay_value.clone());
            }
        }
    }
}
